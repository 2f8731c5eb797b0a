//! Configuration system using Figment.
//!
//! Settings are loaded from a TOML file plus environment variables prefixed
//! with `FOCUSD_` (e.g. `FOCUSD_CAMERA_FPS=15`). The file is read once at
//! startup and again only on an explicit reload request; runtime changes go
//! through [`ConfigUpdate`], which is validated as a whole before anything
//! is applied, so a rejected update leaves the running configuration
//! untouched.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::validation;

/// Default configuration file location on the appliance.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/focusd/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSettings,
    pub estimator: EstimatorConfig,
    pub bus: BusSettings,
    pub service: ServiceSettings,
}

/// Camera acquisition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Target capture rate in frames per second (1-60; the appliance runs
    /// at 15 or below in production).
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Exposure in microseconds.
    pub exposure_us: u32,
    /// Analog gain, 0-30.
    pub gain: u8,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fps: 10,
            width: 320,
            height: 240,
            exposure_us: 1000,
            gain: 0,
        }
    }
}

/// Focus-metric parameters. Swapped atomically as a whole; an in-flight
/// computation always finishes on the snapshot it started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Sigma of the optional denoising blur applied to the crop.
    pub blur_sigma: f64,
    /// Pixels below this value (after background flattening) are zeroed.
    pub background_threshold: f64,
    /// Half-width of the square window cropped around the detected
    /// intensity peak. 0 disables cropping.
    pub crop_radius: u32,
    pub enable_blur: bool,
    /// Fit the horizontal projection with a two-lobe Gaussian (for
    /// astigmatic optics) instead of a single Gaussian.
    pub use_double_gaussian_x: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 11.0,
            background_threshold: 40.0,
            crop_radius: 300,
            enable_blur: true,
            use_double_gaussian_x: false,
        }
    }
}

/// Field-bus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Interface name, e.g. `can0`.
    pub interface: String,
    pub bitrate: u32,
    /// Arbitration id used for outbound focus frames.
    pub tx_id: u16,
    /// Arbitration id that triggers an on-demand reply.
    pub rx_id: u16,
    pub enable_push: bool,
    pub enable_pull: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            bitrate: 100_000,
            tx_id: crate::bus::DEFAULT_TX_ID,
            rx_id: crate::bus::DEFAULT_RX_ID,
            enable_push: true,
            enable_pull: true,
        }
    }
}

/// Service-level parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format ("compact" or "json").
    pub log_format: String,
    /// Upper bound on a single backend capture call.
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            capture_timeout: Duration::from_secs(5),
        }
    }
}

/// Partial runtime update, applied through
/// [`crate::service::FocusService::update_config`]. Absent fields keep
/// their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub fps: Option<u32>,
    pub exposure_us: Option<u32>,
    pub gain: Option<u8>,
    pub blur_sigma: Option<f64>,
    pub background_threshold: Option<f64>,
    pub crop_radius: Option<u32>,
    pub enable_blur: Option<bool>,
    pub use_double_gaussian_x: Option<bool>,
    pub enable_push: Option<bool>,
    pub enable_pull: Option<bool>,
}

impl Settings {
    /// Load from the default path plus `FOCUSD_`-prefixed environment
    /// variables. A missing file yields the built-in defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    ///
    /// Environment variables use `_` as the section separator, e.g.
    /// `FOCUSD_BUS_TX_ID=0x123`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FOCUSD_").split("_"))
            .extract()
    }

    /// Validate semantic constraints after loading.
    ///
    /// Returns the first violation as a human-readable message; the caller
    /// decides whether that is fatal (startup) or a rejected update
    /// (runtime).
    pub fn validate(&self) -> Result<(), String> {
        validation::is_in_range(self.camera.fps, 1..=60)
            .map_err(|_| format!("camera fps {} must be between 1 and 60", self.camera.fps))?;
        validation::is_in_range(self.camera.gain, 0..=30)
            .map_err(|_| format!("camera gain {} must be between 0 and 30", self.camera.gain))?;
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(format!(
                "camera resolution {}x{} must be non-zero",
                self.camera.width, self.camera.height
            ));
        }

        validation::is_positive_finite(self.estimator.blur_sigma)
            .map_err(|_| format!("blur_sigma {} must be positive and finite", self.estimator.blur_sigma))?;
        if !self.estimator.background_threshold.is_finite() {
            return Err("background_threshold must be finite".to_string());
        }

        validation::is_standard_arbitration_id(self.bus.tx_id)
            .map_err(|_| format!("bus tx_id {:#x} must fit in 11 bits", self.bus.tx_id))?;
        validation::is_standard_arbitration_id(self.bus.rx_id)
            .map_err(|_| format!("bus rx_id {:#x} must fit in 11 bits", self.bus.rx_id))?;
        if self.bus.tx_id == self.bus.rx_id {
            return Err(format!(
                "bus tx_id and rx_id must differ (both {:#x})",
                self.bus.tx_id
            ));
        }
        if self.bus.bitrate == 0 {
            return Err("bus bitrate must be positive".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.service.log_level.as_str()) {
            return Err(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.service.log_level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }

    /// Apply a partial update, returning the new validated settings.
    ///
    /// The update is rejected as a whole if any resulting field is invalid;
    /// `self` is never mutated.
    pub fn apply_update(&self, update: &ConfigUpdate) -> Result<Self, String> {
        let mut next = self.clone();
        if let Some(fps) = update.fps {
            next.camera.fps = fps;
        }
        if let Some(exposure_us) = update.exposure_us {
            next.camera.exposure_us = exposure_us;
        }
        if let Some(gain) = update.gain {
            next.camera.gain = gain;
        }
        if let Some(blur_sigma) = update.blur_sigma {
            next.estimator.blur_sigma = blur_sigma;
        }
        if let Some(background_threshold) = update.background_threshold {
            next.estimator.background_threshold = background_threshold;
        }
        if let Some(crop_radius) = update.crop_radius {
            next.estimator.crop_radius = crop_radius;
        }
        if let Some(enable_blur) = update.enable_blur {
            next.estimator.enable_blur = enable_blur;
        }
        if let Some(use_double) = update.use_double_gaussian_x {
            next.estimator.use_double_gaussian_x = use_double;
        }
        if let Some(enable_push) = update.enable_push {
            next.bus.enable_push = enable_push;
        }
        if let Some(enable_pull) = update.enable_pull {
            next.bus.enable_pull = enable_pull;
        }
        next.validate()?;
        Ok(next)
    }
}
