//! GPU worker supervision.
//!
//! This crate provides:
//! - `WorkerSupervisor`: poll loop, dispatch, cancellation, health status
//!   and restart for one worker
//! - The `WorkerCapability` contract with command (ffmpeg) and closure
//!   implementations
//! - Structured job logging

pub mod capability;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod supervisor;

pub use capability::{FnCapability, WorkerCapability};
pub use command::CommandCapability;
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use supervisor::{JobHandle, SupervisorStatus, WorkerSupervisor};
