//! GPU job orchestrator process.
//!
//! This crate provides:
//! - The `Orchestrator` facade over the job ledger, the admission queue and
//!   one supervisor per configured worker
//! - The HTTP API (axum) with request id, logging and metrics middleware
//! - The health monitor that restarts unresponsive workers and triggers
//!   requeueing of their jobs
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod state;

pub use config::{ApiConfig, HealthConfig, OrchestratorConfig, WorkerSpec};
pub use error::{ApiError, ApiResult};
pub use orchestrator::{Orchestrator, SubmitJobResponse, WorkerView};
pub use routes::create_router;
pub use runtime::Runtime;
pub use services::{HealthMonitor, HealthProbe, HttpProbe, SupervisorProbe, WorkerRestarter};
pub use state::AppState;
