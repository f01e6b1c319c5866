//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job execution with
//! tracing spans and contextual information.

use std::time::Duration;

use tracing::{error, info, warn, Span};
use vgate_models::{JobId, Operation, WorkerId};

/// Job logger for structured logging with consistent formatting.
///
/// Every line carries the job id, the worker and the operation.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    worker_id: String,
    operation: &'static str,
}

impl JobLogger {
    pub fn new(job_id: &JobId, worker_id: &WorkerId, operation: Operation) -> Self {
        Self {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            operation: operation.as_str(),
        }
    }

    /// Log the start of execution.
    pub fn log_start(&self, attempt: u32, gpu_cost: u32) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation,
            attempt,
            gpu_cost,
            "Job started"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation,
            "Job error: {}", message
        );
    }

    /// Log the recorded outcome with the wall-clock duration.
    pub fn log_completion(&self, outcome: &str, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation,
            outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job finished"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            operation = self.operation
        )
    }
}
