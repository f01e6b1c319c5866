//! State transition requests.

use chrono::{DateTime, Utc};
use vgate_models::{Job, JobResult, JobState, TransitionRecord, WorkerId};

use crate::error::{LedgerError, LedgerResult};

/// A compare-and-swap state change.
///
/// `from` must match the recorded state for the transition to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub result: Option<JobResult>,
    /// Worker that now holds the reservation (admission only)
    pub worker: Option<WorkerId>,
    /// Set only by `requeue_running`
    increment_attempt: bool,
}

impl Transition {
    pub fn new(from: JobState, to: JobState) -> Self {
        Self {
            from,
            to,
            result: None,
            worker: None,
            increment_attempt: false,
        }
    }

    /// Pending -> Admitted on `worker`.
    pub fn admit(worker: WorkerId) -> Self {
        Self::new(JobState::Pending, JobState::Admitted).with_worker(worker)
    }

    /// Admitted -> Running.
    pub fn start() -> Self {
        Self::new(JobState::Admitted, JobState::Running)
    }

    /// Running -> Succeeded | Failed, depending on the result.
    pub fn finish(result: JobResult) -> Self {
        let to = if result.is_success() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        Self::new(JobState::Running, to).with_result(result)
    }

    /// Running -> Pending after a worker failure.
    pub fn requeue_running() -> Self {
        let mut transition = Self::new(JobState::Running, JobState::Pending);
        transition.increment_attempt = true;
        transition
    }

    /// Admitted -> Pending after a worker restart; the job never started.
    pub fn requeue_admitted() -> Self {
        Self::new(JobState::Admitted, JobState::Pending)
    }

    pub fn with_result(mut self, result: JobResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Whether this transition counts a failed attempt.
    pub fn increments_attempt(&self) -> bool {
        self.increment_attempt
    }

    /// Reject edges outside the job lifecycle.
    pub fn check(&self) -> LedgerResult<()> {
        if !self.from.can_transition_to(self.to) {
            return Err(LedgerError::InvalidTransition {
                from: self.from,
                to: self.to,
            });
        }
        if self.increment_attempt && (self.from, self.to) != (JobState::Running, JobState::Pending) {
            return Err(LedgerError::InvalidTransition {
                from: self.from,
                to: self.to,
            });
        }
        Ok(())
    }

    /// Apply to a job whose state already matched `from`.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        job.state = self.to;
        job.updated_at = now;

        match self.to {
            JobState::Admitted => job.worker_id = self.worker.clone(),
            JobState::Running => job.started_at = Some(now),
            JobState::Pending => {
                job.started_at = None;
                job.worker_id = None;
            }
            _ => {}
        }

        if self.to.is_terminal() {
            job.finished_at = Some(now);
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if self.increment_attempt {
            job.attempt_count += 1;
        }
    }

    /// History entry for this transition.
    pub fn record(&self, job: &Job, now: DateTime<Utc>) -> TransitionRecord {
        TransitionRecord {
            job_id: job.id.clone(),
            from: self.from,
            to: self.to,
            at: now,
            worker_id: self.worker.clone().or_else(|| job.worker_id.clone()),
            result: self.result.clone(),
        }
    }
}
