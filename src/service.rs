//! The orchestrator: binds frame production, focus computation and bus
//! publication into the per-tick pipeline.
//!
//! Each capture tick walks `Idle → Capturing → Estimating → Publishing →
//! Idle`. There is no terminal error state: every per-tick failure is
//! absorbed, logged and retried on the next tick, and only startup problems
//! (invalid configuration) are fatal.
//!
//! Two dedicated threads do the work: the capture thread drives the tick
//! pipeline in-line (so at most one frame is ever in flight), and the
//! listener thread answers bus pull requests from the cache. The control
//! surface and debug stream read through the accessors on
//! [`FocusService`]; they never participate in the tick.
//!
//! Within one tick the cache write happens-before that tick's push publish,
//! so a pull request arriving mid-tick observes either the previous or the
//! current sample, never a torn one.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::BusPublisher;
use crate::cache::LatestValueCache;
use crate::camera::FrameSource;
use crate::config::{ConfigUpdate, Settings};
use crate::data::{FocusSample, Frame};
use crate::error::{AppResult, BusError, FocusdError};
use crate::estimator::FocusEstimator;

/// Wall-clock budget for estimate + publish within one tick. Exceeding it
/// logs a warning; the frame is never dropped over latency.
pub const LATENCY_BUDGET: Duration = Duration::from_millis(40);

/// Cadence of the throughput log line; the window resets afterwards.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Number of recent tick completions kept for the frames/sec estimate.
const THROUGHPUT_WINDOW: usize = 64;

/// State of the capture tick, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Capturing,
    Estimating,
    Publishing,
}

impl TickPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Estimating => "estimating",
            Self::Publishing => "publishing",
        }
    }
}

/// Sliding window over recent tick completion instants.
pub struct ThroughputTracker {
    ticks: Mutex<VecDeque<Instant>>,
}

impl ThroughputTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticks: Mutex::new(VecDeque::with_capacity(THROUGHPUT_WINDOW)),
        }
    }

    pub fn record(&self) {
        let mut ticks = self.ticks.lock();
        if ticks.len() == THROUGHPUT_WINDOW {
            ticks.pop_front();
        }
        ticks.push_back(Instant::now());
    }

    /// Frames per second over the current window; 0 until two ticks have
    /// completed.
    #[must_use]
    pub fn fps(&self) -> f64 {
        let ticks = self.ticks.lock();
        if ticks.len() < 2 {
            return 0.0;
        }
        let span = ticks[ticks.len() - 1].duration_since(ticks[0]).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (ticks.len() - 1) as f64 / span
    }

    /// Clear the window (done at each reporting interval).
    pub fn reset(&self) {
        self.ticks.lock().clear();
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot reported to the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    pub frame_rate: f64,
    pub bus_connected: bool,
    pub has_camera_frame: bool,
    pub backend: String,
}

/// Everything the capture thread needs, shared by `Arc`.
struct TickLoop {
    camera: Arc<FrameSource>,
    estimator: Arc<FocusEstimator>,
    cache: Arc<LatestValueCache>,
    publisher: Arc<BusPublisher>,
    settings: Arc<RwLock<Settings>>,
    throughput: Arc<ThroughputTracker>,
    phase: Arc<Mutex<TickPhase>>,
    stop: Arc<AtomicBool>,
}

impl TickLoop {
    fn set_phase(&self, phase: TickPhase) {
        *self.phase.lock() = phase;
    }

    /// One capture-estimate-publish pass. Failures return the machine to
    /// `Idle`; nothing escapes.
    fn tick(&self) {
        self.set_phase(TickPhase::Capturing);
        let frame = match self.camera.capture_one() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "capture failed, retrying next tick");
                self.set_phase(TickPhase::Idle);
                return;
            }
        };

        self.set_phase(TickPhase::Estimating);
        let busy_started = Instant::now();
        let sample = self.estimator.compute(&frame);
        // Cache before publish: a pull request racing this tick sees either
        // the previous pair or this one, never a partial update.
        self.cache.store(frame, sample);

        self.set_phase(TickPhase::Publishing);
        if self.publisher.push_enabled() {
            match self.publisher.publish(sample.focus) {
                Ok(()) => debug!(focus = sample.focus, "focus published"),
                Err(BusError::Unavailable) => {
                    debug!("bus unavailable, focus not published")
                }
                Err(err) => warn!(error = %err, "focus publish failed"),
            }
        }

        let busy = busy_started.elapsed();
        if busy > LATENCY_BUDGET {
            warn!(
                elapsed_ms = busy.as_millis() as u64,
                budget_ms = LATENCY_BUDGET.as_millis() as u64,
                "tick exceeded latency budget"
            );
        }

        self.throughput.record();
        self.set_phase(TickPhase::Idle);
    }

    fn run(&self) {
        info!("capture loop running");
        let mut last_report = Instant::now();
        while !self.stop.load(Ordering::SeqCst) {
            let tick_started = Instant::now();
            self.tick();

            if last_report.elapsed() >= REPORT_INTERVAL {
                info!(fps = self.throughput.fps(), "throughput");
                self.throughput.reset();
                last_report = Instant::now();
            }

            // Pace to the configured rate; fps changes apply on the next
            // pass without restarting the thread.
            let fps = self.settings.read().camera.fps.max(1);
            let interval = Duration::from_secs_f64(1.0 / f64::from(fps));
            let elapsed = tick_started.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        info!("capture loop stopped");
    }
}

/// The focus telemetry service.
///
/// Owns the camera, estimator, cache and publisher, and the two worker
/// threads. All accessors are safe to call from any thread.
pub struct FocusService {
    camera: Arc<FrameSource>,
    estimator: Arc<FocusEstimator>,
    cache: Arc<LatestValueCache>,
    publisher: Arc<BusPublisher>,
    settings: Arc<RwLock<Settings>>,
    throughput: Arc<ThroughputTracker>,
    phase: Arc<Mutex<TickPhase>>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    capture_handle: Mutex<Option<JoinHandle<()>>>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FocusService {
    /// Build the service from settings: probes the capture backend and
    /// connects the bus (degrading to a no-op publisher when absent).
    pub fn new(settings: Settings) -> AppResult<Self> {
        settings.validate().map_err(FocusdError::ConfigRejected)?;
        let camera = Arc::new(FrameSource::probe(
            settings.camera.clone(),
            settings.service.capture_timeout,
        ));
        let publisher = Arc::new(BusPublisher::connect(&settings.bus));
        Ok(Self::assemble(settings, camera, publisher))
    }

    /// Build on explicit components (tests, alternative transports).
    pub fn with_components(
        settings: Settings,
        camera: Arc<FrameSource>,
        publisher: Arc<BusPublisher>,
    ) -> AppResult<Self> {
        settings.validate().map_err(FocusdError::ConfigRejected)?;
        Ok(Self::assemble(settings, camera, publisher))
    }

    fn assemble(settings: Settings, camera: Arc<FrameSource>, publisher: Arc<BusPublisher>) -> Self {
        let estimator = Arc::new(FocusEstimator::new(settings.estimator.clone()));
        Self {
            camera,
            estimator,
            cache: Arc::new(LatestValueCache::new()),
            publisher,
            settings: Arc::new(RwLock::new(settings)),
            throughput: Arc::new(ThroughputTracker::new()),
            phase: Arc::new(Mutex::new(TickPhase::Idle)),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            capture_handle: Mutex::new(None),
            listener_handle: Mutex::new(None),
        }
    }

    /// Start the capture and listener threads. Idempotent.
    pub fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("service already running");
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);

        let camera_settings = self.settings.read().camera.clone();
        self.camera.start(
            camera_settings.fps,
            camera_settings.exposure_us,
            camera_settings.gain,
        );

        let tick_loop = TickLoop {
            camera: Arc::clone(&self.camera),
            estimator: Arc::clone(&self.estimator),
            cache: Arc::clone(&self.cache),
            publisher: Arc::clone(&self.publisher),
            settings: Arc::clone(&self.settings),
            throughput: Arc::clone(&self.throughput),
            phase: Arc::clone(&self.phase),
            stop: Arc::clone(&self.stop),
        };
        let capture = std::thread::Builder::new()
            .name("focus-capture".to_string())
            .spawn(move || tick_loop.run())
            .map_err(FocusdError::Io)?;
        *self.capture_handle.lock() = Some(capture);

        if self.publisher.is_connected() {
            let publisher = Arc::clone(&self.publisher);
            let cache = Arc::clone(&self.cache);
            let stop = Arc::clone(&self.stop);
            let listener = std::thread::Builder::new()
                .name("bus-listener".to_string())
                .spawn(move || publisher.serve_pull_requests(&cache, &stop))
                .map_err(FocusdError::Io)?;
            *self.listener_handle.lock() = Some(listener);
        }

        info!("service started");
        Ok(())
    }

    /// Signal both threads and join them; each exits after its current
    /// bounded blocking call returns. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.listener_handle.lock().take() {
            let _ = handle.join();
        }
        self.camera.stop();
        info!("service stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current tick phase (observability only).
    #[must_use]
    pub fn phase(&self) -> TickPhase {
        *self.phase.lock()
    }

    /// Latest captured frame, for the debug stream. The stream re-encodes
    /// and transports it; the core never does.
    #[must_use]
    pub fn latest_frame(&self) -> Option<Frame> {
        self.cache.latest_frame()
    }

    /// Latest focus sample, sentinels included. Always answers; before the
    /// first tick this is the `NaN` placeholder.
    #[must_use]
    pub fn latest_focus(&self) -> FocusSample {
        self.cache.latest_focus()
    }

    /// Snapshot of the applied settings.
    #[must_use]
    pub fn current_settings(&self) -> Settings {
        self.settings.read().clone()
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            frame_rate: self.throughput.fps(),
            bus_connected: self.publisher.is_connected(),
            has_camera_frame: self.cache.has_frame(),
            backend: self.camera.backend().as_str().to_string(),
        }
    }

    /// Apply a partial configuration update.
    ///
    /// Validation happens on the merged result before anything changes; a
    /// rejected update leaves every component on its prior configuration.
    pub fn update_config(&self, update: &ConfigUpdate) -> AppResult<()> {
        let next = self
            .settings
            .read()
            .apply_update(update)
            .map_err(FocusdError::ConfigRejected)?;
        self.apply_settings(next);
        Ok(())
    }

    /// Apply a full settings document (explicit reload request).
    pub fn reload_settings(&self, settings: Settings) -> AppResult<()> {
        settings.validate().map_err(FocusdError::ConfigRejected)?;
        self.apply_settings(settings);
        Ok(())
    }

    /// Swap in pre-validated settings: estimator config atomically, camera
    /// settings, bus toggles, then the stored document.
    fn apply_settings(&self, next: Settings) {
        self.estimator.set_config(next.estimator.clone());
        self.camera.apply_settings(&next.camera);
        self.publisher.set_push_enabled(next.bus.enable_push);
        self.publisher.set_pull_enabled(next.bus.enable_pull);
        *self.settings.write() = next;
        info!("configuration updated");
    }
}

impl Drop for FocusService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::BackendKind;

    fn test_service() -> FocusService {
        let mut settings = Settings::default();
        settings.camera.width = 64;
        settings.camera.height = 48;
        settings.camera.fps = 30;
        let camera = Arc::new(FrameSource::with_backend(
            BackendKind::Synthetic,
            settings.camera.clone(),
            Duration::from_secs(1),
        ));
        let publisher = Arc::new(BusPublisher::new(None, &settings.bus));
        FocusService::with_components(settings, camera, publisher).unwrap()
    }

    #[test]
    fn throughput_tracker_needs_two_ticks() {
        let tracker = ThroughputTracker::new();
        assert_eq!(tracker.fps(), 0.0);
        tracker.record();
        assert_eq!(tracker.fps(), 0.0);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record();
        let fps = tracker.fps();
        assert!(fps > 0.0 && fps < 1000.0, "fps = {fps}");

        tracker.reset();
        assert_eq!(tracker.fps(), 0.0);
    }

    #[test]
    fn status_serializes_with_control_surface_names() {
        let service = test_service();
        let status = serde_json::to_value(service.status()).unwrap();
        assert_eq!(status["running"], false);
        assert!(status.get("frameRate").is_some());
        assert_eq!(status["busConnected"], false);
        assert_eq!(status["hasCameraFrame"], false);
    }

    #[test]
    fn invalid_settings_are_fatal_at_construction() {
        let mut settings = Settings::default();
        settings.camera.fps = 0;
        let camera = Arc::new(FrameSource::with_backend(
            BackendKind::Synthetic,
            settings.camera.clone(),
            Duration::from_secs(1),
        ));
        let publisher = Arc::new(BusPublisher::new(None, &settings.bus));
        assert!(matches!(
            FocusService::with_components(settings, camera, publisher),
            Err(FocusdError::ConfigRejected(_))
        ));
    }

    #[test]
    fn rejected_update_changes_nothing() {
        let service = test_service();
        let before = service.current_settings();

        let update = ConfigUpdate {
            fps: Some(0),
            gain: Some(7),
            ..ConfigUpdate::default()
        };
        assert!(service.update_config(&update).is_err());

        let after = service.current_settings();
        assert_eq!(after.camera.fps, before.camera.fps);
        assert_eq!(after.camera.gain, before.camera.gain);
    }

    #[test]
    fn accepted_update_reaches_every_component() {
        let service = test_service();
        let update = ConfigUpdate {
            fps: Some(15),
            enable_blur: Some(false),
            enable_push: Some(false),
            ..ConfigUpdate::default()
        };
        service.update_config(&update).unwrap();

        assert_eq!(service.current_settings().camera.fps, 15);
        assert!(!service.estimator.config().enable_blur);
        assert!(!service.publisher.push_enabled());
        assert_eq!(service.camera.settings().fps, 15);
    }

    #[test]
    fn phase_starts_idle() {
        let service = test_service();
        assert_eq!(service.phase(), TickPhase::Idle);
        assert_eq!(TickPhase::Estimating.as_str(), "estimating");
    }
}
