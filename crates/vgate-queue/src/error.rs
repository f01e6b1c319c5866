//! Queue error types.

use thiserror::Error;
use vgate_ledger::LedgerError;
use vgate_models::{JobId, JobState, WorkerId};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unschedulable: gpu_cost {gpu_cost} exceeds the largest worker capacity ({max_capacity})")]
    Unschedulable { gpu_cost: u32, max_capacity: u32 },

    #[error("Job {id} is {state}, not pending")]
    NotPending { id: JobId, state: JobState },

    #[error("Job {id} is {state} and can no longer be cancelled from the queue")]
    NotQueued { id: JobId, state: JobState },

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker {worker} holds {reserved} GPU units; cannot lower its capacity to {capacity}")]
    CapacityBelowReserved {
        worker: WorkerId,
        capacity: u32,
        reserved: u32,
    },

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(String),

    #[error("Gave up on job {0} after repeated conflicts")]
    Contended(JobId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::LockTimeout(_) | QueueError::Redis(_) | QueueError::Contended(_) => true,
            QueueError::Ledger(e) => e.is_backend() || e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::Ledger(e) if e.is_not_found())
    }
}
