//! Custom error types for the application.
//!
//! This module defines the primary error type, `FocusdError`, plus the
//! per-subsystem errors it wraps. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the failure taxonomy of the
//! pipeline:
//!
//! - **`CaptureError`**: a single capture attempt failed (backend missing,
//!   tool exit status, timeout, decode). These are absorbed by the capture
//!   loop and retried on the next tick; they are never fatal.
//! - **`BusError`**: the field bus is unavailable or a transmit failed.
//!   Transmit failures are logged and never retried (the next push cycle
//!   carries a fresher value anyway).
//! - **`FocusdError::ConfigRejected`**: a configuration update failed
//!   validation; the prior configuration stays in force.
//!
//! Estimation failures deliberately have no error variant: the estimator
//! always produces a [`crate::data::FocusSample`], degrading through its
//! fallback chain to the `NaN`/`+Infinity` sentinel values instead.
//!
//! By using `#[from]`, `FocusdError` can be seamlessly created from the
//! underlying error types, simplifying error handling throughout the
//! application with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FocusdError>;

/// A single frame capture attempt failed.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture backend available")]
    BackendUnavailable,

    #[error("capture tool `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to decode captured image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame source is not started")]
    NotStarted,
}

/// Field-bus transport failure.
#[derive(Error, Debug)]
pub enum BusError {
    /// No transport was available at startup; the publisher is a permanent
    /// no-op and every publish attempt reports this.
    #[error("bus transport unavailable")]
    Unavailable,

    #[error("bus transmit failed: {0}")]
    Transmit(String),

    #[error("bus receive failed: {0}")]
    Receive(String),

    #[error("arbitration id {0:#x} outside the standard 11-bit range")]
    InvalidArbitrationId(u32),
}

#[derive(Error, Debug)]
pub enum FocusdError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_error_converts_into_app_error() {
        let err = CaptureError::BackendUnavailable;
        let app: FocusdError = err.into();
        assert!(matches!(app, FocusdError::Capture(_)));
        assert!(app.to_string().contains("no capture backend"));
    }

    #[test]
    fn bus_error_messages_name_the_failure() {
        let err = BusError::Transmit("tx queue full".into());
        assert_eq!(err.to_string(), "bus transmit failed: tx queue full");

        let err = BusError::InvalidArbitrationId(0x800);
        assert!(err.to_string().contains("0x800"));
    }

    #[test]
    fn config_rejection_keeps_reason() {
        let app = FocusdError::ConfigRejected("fps must be between 1 and 60".into());
        assert!(app.to_string().contains("fps must be between 1 and 60"));
    }
}
