//! Shared data models for the vgate orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle states and results
//! - Job payloads and submission requests
//! - Worker slots, health and GPU reservations
//! - Events exchanged between the health monitor and the admission queue

pub mod event;
pub mod job;
pub mod payload;
pub mod state;
pub mod worker;

// Re-export common types
pub use event::WorkerEvent;
pub use job::{FailureKind, Job, JobId, JobResult, JobView, TransitionRecord};
pub use payload::{JobPayload, Operation, SubmitJobRequest};
pub use state::JobState;
pub use worker::{Claim, HealthStatus, ProbeResult, WorkerId, WorkerSlot};
