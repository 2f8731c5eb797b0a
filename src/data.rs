//! Core value types shared across the pipeline.
//!
//! A [`Frame`] is created once per capture tick and discarded after its
//! [`FocusSample`] has been derived and the latest-value cache updated; no
//! history is retained beyond the single most recent pair. Consumers always
//! receive copies, never live references, so the capture loop can reuse its
//! working buffer without invalidating a reader's view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured image: 8-bit intensities, row-major, `channels` interleaved
/// samples per pixel, plus the acquisition settings active at capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Interleaved pixel data, `width * height * channels` bytes.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for RGB.
    pub channels: u8,
    /// Software capture time.
    pub timestamp: DateTime<Utc>,
    /// Exposure applied for this capture, in microseconds.
    pub exposure_us: u32,
    /// Analog gain applied for this capture (0-30).
    pub gain: u8,
}

impl Frame {
    /// Create a frame stamped with the current time.
    #[must_use]
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            pixels,
            width,
            height,
            channels,
            timestamp: Utc::now(),
            exposure_us: 0,
            gain: 0,
        }
    }

    /// Attach the acquisition settings used for this capture.
    #[must_use]
    pub fn with_settings(mut self, exposure_us: u32, gain: u8) -> Self {
        self.exposure_us = exposure_us;
        self.gain = gain;
        self
    }

    /// Number of pixels (not bytes).
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// A frame is usable when its buffer matches its declared geometry.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.channels > 0
            && self.width > 0
            && self.height > 0
            && self.pixels.len() == self.pixel_count() * self.channels as usize
    }
}

/// One focus measurement: the capture-entry timestamp (unix seconds) and the
/// scalar focus value.
///
/// `focus` may be `NaN` (the computation failed) or `+Infinity` (degenerate
/// vertical width); both are valid, propagated values and are never clamped.
/// The serialized shape `{"t": ..., "focus": ...}` is what the control
/// surface consumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    /// Unix timestamp in seconds, taken at computation entry.
    #[serde(rename = "t")]
    pub timestamp: f64,
    /// Ratio of fitted horizontal to vertical spread.
    pub focus: f64,
}

impl FocusSample {
    /// Sample stamped with the current time.
    #[must_use]
    pub fn new(focus: f64) -> Self {
        Self {
            timestamp: unix_now(),
            focus,
        }
    }

    /// The startup placeholder: `NaN` focus, stamped now. A focus query
    /// before the first completed tick returns this rather than an error.
    #[must_use]
    pub fn invalid() -> Self {
        Self::new(f64::NAN)
    }

    /// True when the value is one of the two sentinel values rather than a
    /// finite measurement.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.focus.is_nan() || self.focus.is_infinite()
    }
}

/// Current unix time in seconds with sub-second resolution.
#[must_use]
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}
