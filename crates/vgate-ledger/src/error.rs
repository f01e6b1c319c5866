//! Ledger error types.

use thiserror::Error;
use vgate_models::{JobId, JobState};

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Conflict on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True if the call lost a compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }

    /// Backend failures, as opposed to caller errors.
    pub fn is_backend(&self) -> bool {
        matches!(self, LedgerError::Database(_) | LedgerError::Corrupt(_))
    }
}
