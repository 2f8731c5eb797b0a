//! Frame acquisition.
//!
//! A [`FrameSource`] delivers one frame per capture tick at the configured
//! rate, applying the exposure and gain active at capture time. The
//! acquisition strategy is probed **once** at construction and stored as an
//! immutable [`BackendKind`] tag; probing shells out to the capture tools
//! and is far too expensive to repeat per frame, and its result is stable
//! for the process lifetime.
//!
//! Priority order: native driver tool (`libcamera-still`) → legacy still
//! tool (`raspistill`) → generic camera tool (`fswebcam`) → synthetic
//! pattern generator. The synthetic backend needs no hardware and is
//! structurally deterministic (a moving Gaussian blob plus bounded seeded
//! noise), so the downstream pipeline and the test suite run anywhere.
//!
//! A failed capture returns a typed [`CaptureError`]; it never escapes the
//! capture loop, which logs and retries on the next tick.

use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CameraSettings;
use crate::data::Frame;
use crate::error::CaptureError;

/// Upper bound on a single probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Seed for the synthetic pattern generator; fixed so runs are repeatable.
const SYNTHETIC_SEED: u64 = 0x0f0c_05d0;

/// Acquisition strategy, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `libcamera-still`, the native CSI camera driver tool.
    NativeDriver,
    /// `raspistill`, the legacy still-image tool.
    LegacyTool,
    /// `fswebcam`, a generic V4L2 capture tool.
    GenericApi,
    /// Hardware-free synthetic pattern generator.
    Synthetic,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeDriver => "libcamera",
            Self::LegacyTool => "raspistill",
            Self::GenericApi => "fswebcam",
            Self::Synthetic => "synthetic",
        }
    }

    /// The probe invocation for tool-backed kinds.
    fn probe_command(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::NativeDriver => Some(("libcamera-still", "--version")),
            Self::LegacyTool => Some(("raspistill", "--help")),
            Self::GenericApi => Some(("fswebcam", "--version")),
            Self::Synthetic => None,
        }
    }
}

/// Moving Gaussian blob plus bounded noise. The blob center sweeps
/// sinusoidally with the frame index, so consecutive frames differ but the
/// sequence is identical on every run.
struct SyntheticPattern {
    rng: StdRng,
    tick: u64,
}

impl SyntheticPattern {
    fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(SYNTHETIC_SEED),
            tick: 0,
        }
    }

    fn generate(&mut self, width: u32, height: u32) -> Vec<u8> {
        let t = self.tick as f64;
        self.tick += 1;

        let (w, h) = (width as f64, height as f64);
        let cx = w / 2.0 + (w / 6.4) * (t * 0.05).sin();
        let cy = h / 2.0 + (h / 8.0) * (t * 0.03).cos();

        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let dx = f64::from(x) - cx;
                let dy = f64::from(y) - cy;
                let blob = 100.0 * (-(dx * dx + dy * dy) / (2.0 * 20.0 * 20.0)).exp();
                let noise: f64 = self.rng.gen_range(-5.0..5.0);
                pixels.push((100.0 + blob + noise).clamp(0.0, 255.0) as u8);
            }
        }
        pixels
    }
}

/// Frame producer with a probe-once backend and an internal latest-frame
/// slot.
pub struct FrameSource {
    kind: BackendKind,
    settings: RwLock<CameraSettings>,
    latest: RwLock<Option<Frame>>,
    running: AtomicBool,
    synthetic: Mutex<SyntheticPattern>,
    capture_timeout: Duration,
}

impl FrameSource {
    /// Probe the backend chain and construct the source. Never fails: with
    /// no capture tool on the system the synthetic generator is selected.
    #[must_use]
    pub fn probe(settings: CameraSettings, capture_timeout: Duration) -> Self {
        let candidates = [
            BackendKind::NativeDriver,
            BackendKind::LegacyTool,
            BackendKind::GenericApi,
        ];
        let kind = candidates
            .into_iter()
            .find(|candidate| match candidate.probe_command() {
                Some((program, arg)) => tool_responds(program, arg),
                None => false,
            })
            .unwrap_or(BackendKind::Synthetic);

        if kind == BackendKind::Synthetic {
            warn!("no capture tool found, using synthetic pattern generator");
        } else {
            info!(backend = kind.as_str(), "capture backend selected");
        }
        Self::with_backend(kind, settings, capture_timeout)
    }

    /// Construct with a known backend (tests, explicit configuration).
    #[must_use]
    pub fn with_backend(
        kind: BackendKind,
        settings: CameraSettings,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            settings: RwLock::new(settings),
            latest: RwLock::new(None),
            running: AtomicBool::new(false),
            synthetic: Mutex::new(SyntheticPattern::new()),
            capture_timeout,
        }
    }

    /// Begin a capture cycle with the given rate and acquisition settings.
    /// Idempotent: calling on a running source only refreshes the settings.
    pub fn start(&self, fps: u32, exposure_us: u32, gain: u8) {
        {
            let mut settings = self.settings.write();
            settings.fps = fps;
            settings.exposure_us = exposure_us;
            settings.gain = gain.min(30);
        }
        if !self.running.swap(true, Ordering::SeqCst) {
            let settings = self.settings.read().clone();
            info!(
                backend = self.kind.as_str(),
                width = settings.width,
                height = settings.height,
                fps = settings.fps,
                "camera started"
            );
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("camera stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.kind
    }

    /// Snapshot of the current acquisition settings.
    #[must_use]
    pub fn settings(&self) -> CameraSettings {
        self.settings.read().clone()
    }

    /// Replace the acquisition settings wholesale (configuration updates).
    pub fn apply_settings(&self, settings: &CameraSettings) {
        let mut current = self.settings.write();
        *current = settings.clone();
        current.gain = current.gain.min(30);
    }

    /// Adjust exposure and/or gain for subsequent captures.
    pub fn update_settings(&self, exposure_us: Option<u32>, gain: Option<u8>) {
        let mut settings = self.settings.write();
        if let Some(exposure_us) = exposure_us {
            settings.exposure_us = exposure_us;
        }
        if let Some(gain) = gain {
            settings.gain = gain.min(30);
        }
        debug!(
            exposure_us = settings.exposure_us,
            gain = settings.gain,
            "camera settings updated"
        );
    }

    /// Perform one capture with the fixed backend.
    ///
    /// On success the internal latest-frame slot is refreshed (under
    /// exclusive access, held only for the swap) and a copy returned.
    pub fn capture_one(&self) -> Result<Frame, CaptureError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::NotStarted);
        }
        let settings = self.settings.read().clone();

        let frame = match self.kind {
            BackendKind::Synthetic => {
                let pixels = self
                    .synthetic
                    .lock()
                    .generate(settings.width, settings.height);
                Frame::new(pixels, settings.width, settings.height, 1)
            }
            kind => {
                let bytes = self.run_capture_tool(kind, &settings)?;
                decode_frame(&bytes)?
            }
        }
        .with_settings(settings.exposure_us, settings.gain);

        *self.latest.write() = Some(frame.clone());
        Ok(frame)
    }

    /// Defensive copy of the most recently captured frame.
    #[must_use]
    pub fn latest(&self) -> Option<Frame> {
        self.latest.read().clone()
    }

    /// Run the backend tool with an enforced timeout; returns the encoded
    /// image bytes.
    fn run_capture_tool(
        &self,
        kind: BackendKind,
        settings: &CameraSettings,
    ) -> Result<Vec<u8>, CaptureError> {
        let output = std::env::temp_dir().join(format!("focusd-frame-{}.jpg", std::process::id()));
        let output_str = output.to_string_lossy().to_string();

        let (program, args): (&str, Vec<String>) = match kind {
            BackendKind::NativeDriver => (
                "libcamera-still",
                vec![
                    "-o".into(),
                    output_str.clone(),
                    "--width".into(),
                    settings.width.to_string(),
                    "--height".into(),
                    settings.height.to_string(),
                    "--timeout".into(),
                    "1".into(),
                    "--nopreview".into(),
                    "--immediate".into(),
                    "--shutter".into(),
                    settings.exposure_us.to_string(),
                    "--gain".into(),
                    settings.gain.to_string(),
                    "--encoding".into(),
                    "jpg".into(),
                ],
            ),
            BackendKind::LegacyTool => (
                "raspistill",
                vec![
                    "-o".into(),
                    output_str.clone(),
                    "-w".into(),
                    settings.width.to_string(),
                    "-h".into(),
                    settings.height.to_string(),
                    "-t".into(),
                    "1".into(),
                    "-n".into(),
                    "-e".into(),
                    "jpg".into(),
                    "-ss".into(),
                    settings.exposure_us.to_string(),
                    "-ag".into(),
                    settings.gain.to_string(),
                ],
            ),
            BackendKind::GenericApi => (
                "fswebcam",
                vec![
                    "-r".into(),
                    format!("{}x{}", settings.width, settings.height),
                    "--no-banner".into(),
                    "--jpeg".into(),
                    "85".into(),
                    output_str.clone(),
                ],
            ),
            BackendKind::Synthetic => unreachable!("synthetic capture has no tool"),
        };

        let mut child = Command::new(program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        match wait_with_timeout(&mut child, self.capture_timeout)? {
            Some(status) if status.success() => {}
            Some(status) => {
                let _ = std::fs::remove_file(&output);
                return Err(CaptureError::CommandFailed {
                    command: program.to_string(),
                    detail: format!("exit status {status}"),
                });
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&output);
                return Err(CaptureError::Timeout(self.capture_timeout));
            }
        }

        let bytes = std::fs::read(&output)?;
        let _ = std::fs::remove_file(&output);
        Ok(bytes)
    }
}

/// Decode tool output (JPEG/PNG) into an RGB frame.
fn decode_frame(bytes: &[u8]) -> Result<Frame, CaptureError> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Frame::new(rgb.into_raw(), width, height, 3))
}

/// True when `program arg` runs and exits successfully within the probe
/// timeout.
fn tool_responds(program: &str, arg: &str) -> bool {
    let child = Command::new(program)
        .arg(arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let Ok(mut child) = child else {
        return false;
    };
    match wait_with_timeout(&mut child, PROBE_TIMEOUT) {
        Ok(Some(status)) => status.success(),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            false
        }
    }
}

/// Poll a child process for completion, bounded by `timeout`.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
