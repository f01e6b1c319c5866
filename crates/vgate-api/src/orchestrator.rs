//! Orchestrator facade: intake, lookups, cancellation and worker views.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vgate_ledger::{JobLedger, Transition};
use vgate_models::{
    FailureKind, Job, JobId, JobResult, JobState, JobView, SubmitJobRequest, TransitionRecord,
    WorkerId, WorkerSlot,
};
use vgate_queue::{AdmissionQueue, QueueError};
use vgate_worker::{SupervisorStatus, WorkerError, WorkerSupervisor};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::services::WorkerRestarter;

/// Attempts at cancelling a job whose state keeps moving underneath us.
const CANCEL_ATTEMPTS: u32 = 5;
const CANCEL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Response of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    /// 1-based position in the pending queue
    pub position: u64,
}

/// A worker's slot together with its supervisor, if one runs here.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub slot: WorkerSlot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorStatus>,
}

/// Composes the ledger, the admission queue and the worker supervisors.
pub struct Orchestrator {
    queue: Arc<AdmissionQueue>,
    supervisors: BTreeMap<WorkerId, Arc<WorkerSupervisor>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        supervisors: impl IntoIterator<Item = Arc<WorkerSupervisor>>,
    ) -> Self {
        let supervisors = supervisors
            .into_iter()
            .map(|s| (s.worker_id().clone(), s))
            .collect();
        Self { queue, supervisors }
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        self.queue.ledger()
    }

    pub fn supervisor(&self, worker: &WorkerId) -> Option<&Arc<WorkerSupervisor>> {
        self.supervisors.get(worker)
    }

    pub fn supervisors(&self) -> impl Iterator<Item = &Arc<WorkerSupervisor>> {
        self.supervisors.values()
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Validate, record and enqueue a job.
    ///
    /// Invalid and unschedulable requests never reach the ledger.
    pub async fn submit(&self, request: SubmitJobRequest) -> ApiResult<SubmitJobResponse> {
        if let Err(detail) = request.check() {
            metrics::record_job_rejected("validation");
            return Err(ApiError::validation(detail));
        }

        if let Err(e) = self.queue.check_schedulable(request.gpu_cost).await {
            if matches!(e, QueueError::Unschedulable { .. }) {
                metrics::record_job_rejected("unschedulable");
            }
            return Err(e.into());
        }

        let (payload, gpu_cost) = request.into_parts();
        let operation = payload.operation;
        let job = self.ledger().create(payload, gpu_cost).await?;

        let position = match self.queue.enqueue(&job).await {
            Ok(position) => position,
            Err(e) => {
                self.abandon(&job, &e).await;
                return Err(e.into());
            }
        };

        metrics::record_job_submitted(operation.as_str());
        info!(
            job_id = %job.id,
            operation = %operation,
            gpu_cost,
            position,
            "Job submitted"
        );

        Ok(SubmitJobResponse {
            job_id: job.id,
            position,
        })
    }

    /// Fail a recorded job that never made it into the queue.
    async fn abandon(&self, job: &Job, cause: &QueueError) {
        let result = JobResult::error(
            FailureKind::TaskFailure,
            format!("could not be queued: {}", cause),
        );
        let transition = Transition::new(JobState::Pending, JobState::Failed).with_result(result);
        if let Err(e) = self.ledger().transition(&job.id, transition).await {
            warn!(job_id = %job.id, error = %e, "Failed to mark unqueued job as failed");
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    async fn load(&self, id: &JobId) -> ApiResult<Job> {
        if !JobId::is_valid(id.as_str()) {
            return Err(ApiError::not_found(format!("Job not found: {}", id)));
        }
        Ok(self.ledger().get(id).await?)
    }

    pub async fn job(&self, id: &JobId) -> ApiResult<JobView> {
        Ok(self.load(id).await?.view())
    }

    pub async fn history(&self, id: &JobId) -> ApiResult<Vec<TransitionRecord>> {
        self.load(id).await?;
        Ok(self.ledger().history(id).await?)
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a job.
    ///
    /// Pending and Admitted jobs end Cancelled; a Running job is stopped
    /// through its supervisor and ends Failed with a `cancelled` result.
    /// Terminal jobs yield `Conflict`.
    pub async fn cancel(&self, id: &JobId) -> ApiResult<JobView> {
        for attempt in 1..=CANCEL_ATTEMPTS {
            let job = self.load(id).await?;

            match job.state {
                JobState::Pending | JobState::Admitted => match self.queue.cancel_queued(id).await {
                    Ok(cancelled) => return Ok(cancelled.view()),
                    // Dispatched or finished meanwhile
                    Err(QueueError::NotQueued { .. }) => continue,
                    Err(e) => return Err(e.into()),
                },
                JobState::Running => {
                    let last = attempt == CANCEL_ATTEMPTS;
                    if self.cancel_running(&job, last).await? {
                        return Ok(self.ledger().get(id).await?.view());
                    }
                    tokio::time::sleep(CANCEL_RETRY_DELAY).await;
                }
                state => {
                    return Err(ApiError::conflict(format!("Job {} is already {}", id, state)));
                }
            }
        }

        Err(ApiError::Unavailable(format!(
            "job {} kept changing state, retry the cancellation",
            id
        )))
    }

    /// Returns false when the job should be looked at again.
    ///
    /// With `force`, a Running job no live task owns is failed here and its
    /// claim released.
    async fn cancel_running(&self, job: &Job, force: bool) -> ApiResult<bool> {
        let supervisor = job.worker_id.as_ref().and_then(|w| self.supervisors.get(w));

        if let Some(supervisor) = supervisor {
            match supervisor.cancel_job(&job.id).await {
                Ok(()) => return Ok(true),
                // Between the start transition and task registration, or
                // abandoned by a restart
                Err(WorkerError::NotRunning(_)) if !force => return Ok(false),
                Err(WorkerError::NotRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let result = JobResult::error(FailureKind::Cancelled, "cancelled while running");
        match self.ledger().transition(&job.id, Transition::finish(result)).await {
            Ok(_) => {
                self.queue.release(&job.id).await?;
                info!(job_id = %job.id, "Running job cancelled without a live task");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn view_of(&self, slot: WorkerSlot) -> WorkerView {
        let supervisor = match self.supervisors.get(&slot.worker_id) {
            Some(supervisor) => Some(supervisor.snapshot().await),
            None => None,
        };
        WorkerView { slot, supervisor }
    }

    pub async fn workers(&self) -> ApiResult<Vec<WorkerView>> {
        let slots = self.queue.slots().await?;
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            views.push(self.view_of(slot).await);
        }
        Ok(views)
    }

    pub async fn worker(&self, id: &WorkerId) -> ApiResult<WorkerView> {
        let slot = self.queue.slot(id).await?;
        Ok(self.view_of(slot).await)
    }
}

#[async_trait]
impl WorkerRestarter for Orchestrator {
    async fn restart(&self, worker: &WorkerId) -> ApiResult<()> {
        let supervisor = self
            .supervisors
            .get(worker)
            .ok_or_else(|| ApiError::not_found(format!("No supervisor for worker {}", worker)))?;
        supervisor.restart().await;
        Ok(())
    }
}
