//! # focusd Core Library
//!
//! This crate is the core of the `focusd` autofocus telemetry appliance. It
//! repeatedly captures a camera frame, reduces it to a single scalar focus
//! value, and makes that value available to a low-latency field-bus broadcast
//! and an on-demand request/response channel, while keeping the raw frame
//! around for visual debugging. The HTTP control surface and the MJPEG debug
//! stream are external collaborators; they consume this crate through the
//! handles exposed by [`service::FocusService`].
//!
//! ## Crate Structure
//!
//! - **`camera`**: Frame acquisition with a probe-once backend chain
//!   (vendor capture tools, falling back to a synthetic pattern generator).
//! - **`estimator`**: The focus metric. Preprocesses a frame, projects it
//!   onto both axes and fits 1-D Gaussians; the focus value is the ratio of
//!   the fitted widths.
//! - **`cache`**: Lock-protected holder of the most recent frame and focus
//!   sample, shared by every consumer.
//! - **`bus`**: Field-bus publication: the 8-byte wire codec, the transport
//!   abstraction (SocketCAN behind the `can-hardware` feature, an in-memory
//!   bus for tests) and the push/pull publisher.
//! - **`service`**: The orchestrator binding capture, estimation and
//!   publication together under the per-frame latency budget.
//! - **`config`**: TOML + environment configuration via `figment`, with
//!   validation and partial runtime updates.
//! - **`error`**: Central error types (`thiserror`).
//! - **`logging`**: `tracing` subscriber initialization.
//! - **`data`**: The `Frame` and `FocusSample` value types.
//! - **`validation`**: Small parameter validators used by `config`.

pub mod bus;
pub mod cache;
pub mod camera;
pub mod config;
pub mod data;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod service;
pub mod validation;

pub use cache::LatestValueCache;
pub use camera::{BackendKind, FrameSource};
pub use config::Settings;
pub use data::{FocusSample, Frame};
pub use error::{AppResult, FocusdError};
pub use estimator::FocusEstimator;
pub use service::FocusService;
