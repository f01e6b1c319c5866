//! Worker error types.

use thiserror::Error;
use vgate_ledger::LedgerError;
use vgate_models::{JobId, WorkerId};
use vgate_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Job {id} is not assigned to worker {worker}")]
    NotAssigned { id: JobId, worker: WorkerId },

    #[error("Job {0} is not running on this worker")]
    NotRunning(JobId),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The ledger rejected a transition because the job moved on.
    pub fn is_conflict(&self) -> bool {
        match self {
            WorkerError::Ledger(e) => e.is_conflict(),
            WorkerError::Queue(QueueError::Ledger(e)) => e.is_conflict(),
            _ => false,
        }
    }
}
