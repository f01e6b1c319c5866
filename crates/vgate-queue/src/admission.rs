//! Admission of Pending jobs against per-worker GPU capacity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures_util::TryStreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vgate_ledger::{JobLedger, Transition};
use vgate_models::{
    Claim, FailureKind, HealthStatus, Job, JobId, JobResult, JobState, WorkerId, WorkerSlot,
};

use crate::config::{AdmissionPolicy, QueueConfig, StoreBackend};
use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::store::{CapacityOutcome, MemoryStore, RedisStore, ReservationStore, ReserveOutcome};

const ADMISSION_LOCK: &str = "admission";

/// Attempts at a CAS-guarded step before giving up with `Contended`.
const CONFLICT_RETRIES: u32 = 3;

/// What `requeue_worker` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequeueReport {
    /// Back in the queue
    pub requeued: Vec<JobId>,
    /// Failed with `attempts_exhausted`
    pub exhausted: Vec<JobId>,
    /// Already settled elsewhere; only the stale claim was released
    pub skipped: Vec<JobId>,
    /// GPU units returned to the slot
    pub released_gpu: u32,
}

impl RequeueReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty() && self.skipped.is_empty()
    }
}

/// FIFO admission queue over a job ledger and a reservation store.
///
/// Admission, requeue and queued-job cancellation each run under the store's
/// admission lock. Reservations are conditional increments in the store, so
/// `reserved_gpu <= total_gpu_capacity` holds even without the lock.
pub struct AdmissionQueue {
    ledger: Arc<dyn JobLedger>,
    store: Arc<dyn ReservationStore>,
    config: QueueConfig,
    /// Restarted workers whose jobs have not been requeued yet
    awaiting_requeue: Mutex<HashSet<WorkerId>>,
}

impl AdmissionQueue {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        store: Arc<dyn ReservationStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            config,
            awaiting_requeue: Mutex::new(HashSet::new()),
        }
    }

    /// Build the store selected by `config.backend`.
    pub fn from_config(ledger: Arc<dyn JobLedger>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let store: Arc<dyn ReservationStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => Arc::new(RedisStore::new(&config.redis_url, &config.key_prefix)?),
        };
        Ok(Self::new(ledger, store, config))
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.config.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Create the worker's slot, or refresh its capacity keeping the reservation.
    ///
    /// A capacity below what the slot currently holds is refused; requeue the
    /// worker first to drain it.
    pub async fn register_worker(&self, worker: &WorkerId, capacity: u32) -> QueueResult<()> {
        if capacity == 0 {
            return Err(QueueError::validation(format!(
                "worker {} must have a positive GPU capacity",
                worker
            )));
        }
        if let CapacityOutcome::BelowReserved { reserved } =
            self.store.set_capacity(worker, capacity).await?
        {
            return Err(QueueError::CapacityBelowReserved {
                worker: worker.clone(),
                capacity,
                reserved,
            });
        }
        let slot = self.slot(worker).await?;
        metrics::record_slot(&slot);
        info!(worker_id = %worker, capacity, reserved = slot.reserved_gpu, "Worker registered");
        Ok(())
    }

    pub async fn slot(&self, worker: &WorkerId) -> QueueResult<WorkerSlot> {
        self.store
            .slot(worker)
            .await?
            .ok_or_else(|| QueueError::UnknownWorker(worker.clone()))
    }

    pub async fn slots(&self) -> QueueResult<Vec<WorkerSlot>> {
        self.store.slots().await
    }

    pub async fn set_health(&self, worker: &WorkerId, status: HealthStatus) -> QueueResult<()> {
        if !self.store.set_health(worker, status).await? {
            return Err(QueueError::UnknownWorker(worker.clone()));
        }
        debug!(worker_id = %worker, status = %status, "Slot health updated");
        Ok(())
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Reject costs no registered worker could ever satisfy.
    pub async fn check_schedulable(&self, gpu_cost: u32) -> QueueResult<()> {
        if gpu_cost == 0 {
            return Err(QueueError::validation("gpu_cost must be a positive integer"));
        }

        let max_capacity = self
            .store
            .slots()
            .await?
            .iter()
            .map(|slot| slot.total_gpu_capacity)
            .max()
            .unwrap_or(0);

        if gpu_cost > max_capacity {
            return Err(QueueError::Unschedulable {
                gpu_cost,
                max_capacity,
            });
        }
        Ok(())
    }

    /// Append a Pending job to the queue; returns its 1-based position.
    pub async fn enqueue(&self, job: &Job) -> QueueResult<u64> {
        self.check_schedulable(job.gpu_cost).await?;
        if job.state != JobState::Pending {
            return Err(QueueError::NotPending {
                id: job.id.clone(),
                state: job.state,
            });
        }

        let position = self.store.push_pending(&job.id).await?;
        metrics::record_enqueued();
        self.publish_queue_length().await;

        debug!(job_id = %job.id, gpu_cost = job.gpu_cost, position, "Job enqueued");
        Ok(position)
    }

    pub async fn queue_len(&self) -> QueueResult<u64> {
        self.store.pending_len().await
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit the next eligible Pending job onto `worker`, if any.
    ///
    /// On success the job is Admitted, recorded against `worker`, and holds a
    /// claim for its `gpu_cost`.
    pub async fn try_admit(&self, worker: &WorkerId) -> QueueResult<Option<Job>> {
        let token = self.lock().await?;
        let result = self.admit_locked(worker).await;
        self.unlock(token).await;
        result
    }

    async fn admit_locked(&self, worker: &WorkerId) -> QueueResult<Option<Job>> {
        if self.awaiting_requeue(worker).await {
            return Ok(None);
        }
        let slot = self.slot(worker).await?;
        if !slot.health_status.admits_work() {
            return Ok(None);
        }
        let remaining = slot.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        for id in self.store.pending(self.config.scan_limit).await? {
            let job = match self.ledger.get(&id).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => {
                    warn!(job_id = %id, "Dropping queue entry for unknown job");
                    self.store.remove_pending(&id).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Cancelled or failed while queued
            if job.state != JobState::Pending {
                self.store.remove_pending(&id).await?;
                continue;
            }

            if job.gpu_cost > remaining {
                match self.config.policy {
                    AdmissionPolicy::StrictFifo => return Ok(None),
                    AdmissionPolicy::FirstFit => continue,
                }
            }

            let claim = Claim::new(job.id.clone(), worker.clone(), job.gpu_cost);
            match self.store.try_reserve(&claim).await? {
                ReserveOutcome::Reserved => {}
                ReserveOutcome::Insufficient => match self.config.policy {
                    AdmissionPolicy::StrictFifo => return Ok(None),
                    AdmissionPolicy::FirstFit => continue,
                },
                ReserveOutcome::AlreadyClaimed => {
                    warn!(job_id = %id, "Pending job still holds a claim, skipping");
                    continue;
                }
                ReserveOutcome::UnknownWorker => {
                    return Err(QueueError::UnknownWorker(worker.clone()))
                }
            }

            match self.ledger.transition(&id, Transition::admit(worker.clone())).await {
                Ok(admitted) => {
                    self.store.remove_pending(&id).await?;
                    metrics::record_admitted(worker.as_str());
                    self.publish_slot(worker).await;
                    self.publish_queue_length().await;
                    info!(
                        job_id = %id,
                        worker_id = %worker,
                        gpu_cost = admitted.gpu_cost,
                        "Job admitted"
                    );
                    return Ok(Some(admitted));
                }
                Err(e) if e.is_conflict() => {
                    // Lost the job to a concurrent transition; undo the reservation
                    self.store.release(&id).await?;
                    self.store.remove_pending(&id).await?;
                    continue;
                }
                Err(e) => {
                    self.store.release(&id).await?;
                    return Err(e.into());
                }
            }
        }

        Ok(None)
    }

    /// Give back the capacity held by the job's claim.
    ///
    /// Idempotent: only the first call returns the claim.
    pub async fn release(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        let claim = self.store.release(job_id).await?;
        if let Some(claim) = &claim {
            metrics::record_released(claim.worker_id.as_str());
            self.publish_slot(&claim.worker_id).await;
            debug!(
                job_id = %job_id,
                worker_id = %claim.worker_id,
                gpu_cost = claim.gpu_cost,
                "Claim released"
            );
        }
        Ok(claim)
    }

    pub async fn claim(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        self.store.claim(job_id).await
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Close the worker to admissions until its next successful requeue.
    pub async fn hold_for_requeue(&self, worker: &WorkerId) {
        self.awaiting_requeue.lock().await.insert(worker.clone());
    }

    pub async fn awaiting_requeue(&self, worker: &WorkerId) -> bool {
        self.awaiting_requeue.lock().await.contains(worker)
    }

    /// Move every Admitted or Running job on `worker` back to Pending.
    ///
    /// Running jobs count a failed attempt and fail with `attempts_exhausted`
    /// once past `max_attempts`. Each claim is released only after its job's
    /// state change has committed.
    pub async fn requeue_worker(&self, worker: &WorkerId) -> QueueResult<RequeueReport> {
        let token = self.lock().await?;
        let result = self.requeue_locked(worker).await;
        if result.is_ok() {
            self.awaiting_requeue.lock().await.remove(worker);
        }
        self.unlock(token).await;

        if let Ok(report) = &result {
            if !report.is_empty() {
                info!(
                    worker_id = %worker,
                    requeued = report.requeued.len(),
                    exhausted = report.exhausted.len(),
                    skipped = report.skipped.len(),
                    released_gpu = report.released_gpu,
                    "Worker jobs requeued"
                );
            }
        }
        result
    }

    async fn requeue_locked(&self, worker: &WorkerId) -> QueueResult<RequeueReport> {
        let mut candidates: Vec<JobId> = self
            .store
            .claims_for(worker)
            .await?
            .into_iter()
            .map(|claim| claim.job_id)
            .collect();
        let mut seen: HashSet<JobId> = candidates.iter().cloned().collect();

        // The ledger is authoritative if the store lost claims
        for state in JobState::ALL.into_iter().filter(JobState::holds_reservation) {
            let on_worker: Vec<Job> = self
                .ledger
                .list_by_state(state)
                .try_filter(|job| futures_util::future::ready(job.worker_id.as_ref() == Some(worker)))
                .try_collect()
                .await?;
            for job in on_worker {
                if seen.insert(job.id.clone()) {
                    candidates.push(job.id);
                }
            }
        }

        let mut report = RequeueReport::default();
        for id in candidates {
            self.requeue_one(worker, &id, &mut report).await?;
        }

        self.publish_slot(worker).await;
        self.publish_queue_length().await;
        Ok(report)
    }

    /// Put back one job `worker` admitted but could not start.
    ///
    /// Same rules as `requeue_worker`, for a single job.
    pub async fn return_job(&self, worker: &WorkerId, id: &JobId) -> QueueResult<RequeueReport> {
        let token = self.lock().await?;
        let mut report = RequeueReport::default();
        let result = self.requeue_one(worker, id, &mut report).await;
        self.unlock(token).await;
        result?;

        self.publish_slot(worker).await;
        self.publish_queue_length().await;
        debug!(job_id = %id, worker_id = %worker, "Job returned to the queue");
        Ok(report)
    }

    async fn requeue_one(
        &self,
        worker: &WorkerId,
        id: &JobId,
        report: &mut RequeueReport,
    ) -> QueueResult<()> {
        for _ in 0..CONFLICT_RETRIES {
            let job = match self.ledger.get(id).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => {
                    self.release_into(id, report).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let (transition, from) = match job.state {
                JobState::Running => (Transition::requeue_running(), "running"),
                JobState::Admitted => (Transition::requeue_admitted(), "admitted"),
                JobState::Pending => {
                    // An earlier pass moved it but did not finish
                    self.settle_pending(job, report).await?;
                    self.release_into(id, report).await?;
                    return Ok(());
                }
                _ => {
                    // Finished before the restart; its finisher never released
                    report.skipped.push(id.clone());
                    self.release_into(id, report).await?;
                    return Ok(());
                }
            };

            match self.ledger.transition(id, transition).await {
                Ok(requeued) => {
                    metrics::record_requeued(worker.as_str(), from);
                    self.settle_pending(requeued, report).await?;
                    self.release_into(id, report).await?;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::Contended(id.clone()))
    }

    /// Queue a requeued job again, or fail it if it is out of attempts.
    async fn settle_pending(&self, job: Job, report: &mut RequeueReport) -> QueueResult<()> {
        if job.attempt_count > self.config.max_attempts {
            let result = JobResult::error(
                FailureKind::AttemptsExhausted,
                format!(
                    "worker failed {} times (max {})",
                    job.attempt_count, self.config.max_attempts
                ),
            );
            self.ledger
                .transition(
                    &job.id,
                    Transition::new(JobState::Pending, JobState::Failed).with_result(result),
                )
                .await?;
            self.store.remove_pending(&job.id).await?;
            metrics::record_exhausted();
            warn!(job_id = %job.id, attempts = job.attempt_count, "Job out of attempts");
            report.exhausted.push(job.id);
        } else {
            self.store.push_pending(&job.id).await?;
            debug!(job_id = %job.id, attempts = job.attempt_count, "Job requeued");
            report.requeued.push(job.id);
        }
        Ok(())
    }

    async fn release_into(&self, id: &JobId, report: &mut RequeueReport) -> QueueResult<()> {
        if let Some(claim) = self.store.release(id).await? {
            metrics::record_released(claim.worker_id.as_str());
            report.released_gpu += claim.gpu_cost;
        }
        Ok(())
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a Pending or Admitted job and free whatever it held.
    ///
    /// Running and terminal jobs yield `NotQueued`.
    pub async fn cancel_queued(&self, id: &JobId) -> QueueResult<Job> {
        let token = self.lock().await?;
        let result = self.cancel_locked(id).await;
        self.unlock(token).await;
        result
    }

    async fn cancel_locked(&self, id: &JobId) -> QueueResult<Job> {
        for _ in 0..CONFLICT_RETRIES {
            let job = self.ledger.get(id).await?;
            if !matches!(job.state, JobState::Pending | JobState::Admitted) {
                return Err(QueueError::NotQueued {
                    id: id.clone(),
                    state: job.state,
                });
            }

            let transition = Transition::new(job.state, JobState::Cancelled)
                .with_result(JobResult::error(FailureKind::Cancelled, "cancelled before start"));

            match self.ledger.transition(id, transition).await {
                Ok(cancelled) => {
                    self.store.remove_pending(id).await?;
                    if let Some(claim) = self.store.release(id).await? {
                        metrics::record_released(claim.worker_id.as_str());
                        self.publish_slot(&claim.worker_id).await;
                    }
                    metrics::record_cancelled();
                    self.publish_queue_length().await;
                    info!(job_id = %id, from = %job.state, "Job cancelled");
                    return Ok(cancelled);
                }
                // Dispatched or cancelled concurrently; look again
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::Contended(id.clone()))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub async fn ping(&self) -> QueueResult<()> {
        self.store.ping().await
    }

    async fn lock(&self) -> QueueResult<String> {
        let start = Instant::now();
        loop {
            if let Some(token) = self
                .store
                .try_lock(ADMISSION_LOCK, self.config.lock_ttl)
                .await?
            {
                metrics::record_lock_wait(start.elapsed().as_secs_f64(), true);
                return Ok(token);
            }
            if start.elapsed() >= self.config.lock_wait {
                metrics::record_lock_wait(start.elapsed().as_secs_f64(), false);
                return Err(QueueError::LockTimeout(ADMISSION_LOCK.to_string()));
            }
            tokio::time::sleep(self.config.lock_retry_interval).await;
        }
    }

    async fn unlock(&self, token: String) {
        match self.store.unlock(ADMISSION_LOCK, &token).await {
            Ok(true) => {}
            Ok(false) => warn!("Admission lock expired before it was released"),
            Err(e) => warn!(error = %e, "Failed to release admission lock"),
        }
    }

    async fn publish_slot(&self, worker: &WorkerId) {
        if let Ok(Some(slot)) = self.store.slot(worker).await {
            metrics::record_slot(&slot);
        }
    }

    async fn publish_queue_length(&self) {
        if let Ok(len) = self.store.pending_len().await {
            metrics::record_queue_length(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgate_ledger::MemoryLedger;
    use vgate_models::{JobPayload, Operation};

    fn queue(policy: AdmissionPolicy) -> AdmissionQueue {
        queue_with(QueueConfig::memory().with_policy(policy))
    }

    fn queue_with(config: QueueConfig) -> AdmissionQueue {
        AdmissionQueue::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryStore::new()),
            config,
        )
    }

    fn worker() -> WorkerId {
        WorkerId::from("gpu-0")
    }

    async fn submit(queue: &AdmissionQueue, gpu_cost: u32) -> Job {
        let job = queue
            .ledger()
            .create(JobPayload::new(Operation::Transcode, "/media/in.mp4"), gpu_cost)
            .await
            .unwrap();
        queue.enqueue(&job).await.unwrap();
        job
    }

    async fn state(queue: &AdmissionQueue, id: &JobId) -> Job {
        queue.ledger().get(id).await.unwrap()
    }

    async fn start(queue: &AdmissionQueue, id: &JobId) {
        queue.ledger().transition(id, Transition::start()).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_four_with_costs_two_two_three() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();

        let job1 = submit(&queue, 2).await;
        let job2 = submit(&queue, 2).await;
        let job3 = submit(&queue, 3).await;

        assert_eq!(queue.try_admit(&worker()).await.unwrap().unwrap().id, job1.id);
        assert_eq!(queue.try_admit(&worker()).await.unwrap().unwrap().id, job2.id);
        assert!(queue.try_admit(&worker()).await.unwrap().is_none());
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 4);

        // job1 finishes and releases; job3 still needs 3 > 2
        start(&queue, &job1.id).await;
        queue
            .ledger()
            .transition(&job1.id, Transition::finish(JobResult::artifact("out1")))
            .await
            .unwrap();
        queue.release(&job1.id).await.unwrap();
        assert!(queue.try_admit(&worker()).await.unwrap().is_none());

        queue
            .ledger()
            .transition(&job2.id, Transition::new(JobState::Admitted, JobState::Cancelled))
            .await
            .unwrap();
        queue.release(&job2.id).await.unwrap();

        let admitted = queue.try_admit(&worker()).await.unwrap().unwrap();
        assert_eq!(admitted.id, job3.id);
        assert_eq!(admitted.state, JobState::Admitted);
        assert_eq!(admitted.worker_id, Some(worker()));
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 3);
    }

    #[tokio::test]
    async fn test_strict_fifo_blocks_behind_large_head() {
        let queue = queue(AdmissionPolicy::StrictFifo);
        queue.register_worker(&worker(), 4).await.unwrap();

        submit(&queue, 3).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let big = submit(&queue, 3).await;
        let small = submit(&queue, 1).await;

        assert!(queue.try_admit(&worker()).await.unwrap().is_none());
        assert_eq!(state(&queue, &big.id).await.state, JobState::Pending);
        assert_eq!(state(&queue, &small.id).await.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_first_fit_admits_smaller_job_behind() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();

        submit(&queue, 3).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let big = submit(&queue, 3).await;
        let small = submit(&queue, 1).await;

        let admitted = queue.try_admit(&worker()).await.unwrap().unwrap();
        assert_eq!(admitted.id, small.id);
        assert_eq!(state(&queue, &big.id).await.state, JobState::Pending);
        assert_eq!(queue.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unschedulable_and_zero_cost() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        queue.register_worker(&WorkerId::from("gpu-1"), 2).await.unwrap();

        assert!(queue.check_schedulable(4).await.is_ok());
        assert!(matches!(
            queue.check_schedulable(5).await,
            Err(QueueError::Unschedulable {
                gpu_cost: 5,
                max_capacity: 4
            })
        ));
        assert!(matches!(
            queue.check_schedulable(0).await,
            Err(QueueError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_pending() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 1).await;
        let admitted = queue.try_admit(&worker()).await.unwrap().unwrap();
        assert_eq!(admitted.id, job.id);

        assert!(matches!(
            queue.enqueue(&admitted).await,
            Err(QueueError::NotPending { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 2).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let claim = queue.release(&job.id).await.unwrap().unwrap();
        assert_eq!(claim.gpu_cost, 2);
        assert!(queue.release(&job.id).await.unwrap().is_none());
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_slot_admits_nothing() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        submit(&queue, 1).await;

        queue.set_health(&worker(), HealthStatus::Unresponsive).await.unwrap();
        assert!(queue.try_admit(&worker()).await.unwrap().is_none());

        queue.set_health(&worker(), HealthStatus::Healthy).await.unwrap();
        assert!(queue.try_admit(&worker()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let queue = queue(AdmissionPolicy::FirstFit);
        assert!(matches!(
            queue.try_admit(&worker()).await,
            Err(QueueError::UnknownWorker(_))
        ));
        assert!(queue.set_health(&worker(), HealthStatus::Healthy).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_cannot_shrink_below_reservation() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        submit(&queue, 4).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let err = queue.register_worker(&worker(), 2).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::CapacityBelowReserved {
                capacity: 2,
                reserved: 4,
                ..
            }
        ));
        let slot = queue.slot(&worker()).await.unwrap();
        assert_eq!(slot.total_gpu_capacity, 4);
        assert_eq!(slot.reserved_gpu, 4);

        // Drained first, the smaller capacity applies
        queue.requeue_worker(&worker()).await.unwrap();
        queue.register_worker(&worker(), 2).await.unwrap();
        let slot = queue.slot(&worker()).await.unwrap();
        assert_eq!(slot.total_gpu_capacity, 2);
        assert_eq!(slot.reserved_gpu, 0);
    }

    #[tokio::test]
    async fn test_worker_held_for_requeue_admits_nothing() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 1).await;

        queue.hold_for_requeue(&worker()).await;
        // Health alone does not reopen the slot
        queue.set_health(&worker(), HealthStatus::Healthy).await.unwrap();
        assert!(queue.try_admit(&worker()).await.unwrap().is_none());

        queue.requeue_worker(&worker()).await.unwrap();
        assert!(!queue.awaiting_requeue(&worker()).await);
        assert_eq!(queue.try_admit(&worker()).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_return_job_puts_unstarted_job_back() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 3).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let report = queue.return_job(&worker(), &job.id).await.unwrap();
        assert_eq!(report.requeued, vec![job.id.clone()]);
        assert_eq!(report.released_gpu, 3);

        let returned = state(&queue, &job.id).await;
        assert_eq!(returned.state, JobState::Pending);
        assert_eq!(returned.attempt_count, 0);
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 0);
        assert_eq!(queue.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_running_job_counts_attempt() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 2).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();
        start(&queue, &job.id).await;

        let report = queue.requeue_worker(&worker()).await.unwrap();
        assert_eq!(report.requeued, vec![job.id.clone()]);
        assert_eq!(report.released_gpu, 2);

        let requeued = state(&queue, &job.id).await;
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 0);

        // Exactly once: a second pass finds nothing to do
        let again = queue.requeue_worker(&worker()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(state(&queue, &job.id).await.attempt_count, 1);

        let readmitted = queue.try_admit(&worker()).await.unwrap().unwrap();
        assert_eq!(readmitted.id, job.id);
    }

    #[tokio::test]
    async fn test_requeue_admitted_job_keeps_attempts() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 1).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let report = queue.requeue_worker(&worker()).await.unwrap();
        assert_eq!(report.requeued, vec![job.id.clone()]);

        let requeued = state(&queue, &job.id).await;
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.attempt_count, 0);
        assert!(requeued.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_job_fails_and_is_never_readmitted() {
        let queue = queue_with(QueueConfig::memory().with_max_attempts(1));
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 1).await;

        for _ in 0..2 {
            queue.try_admit(&worker()).await.unwrap().unwrap();
            start(&queue, &job.id).await;
            queue.requeue_worker(&worker()).await.unwrap();
        }

        let failed = state(&queue, &job.id).await;
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempt_count, 2);
        assert_eq!(
            failed.result.and_then(|r| r.failure_kind()),
            Some(FailureKind::AttemptsExhausted)
        );
        assert!(queue.try_admit(&worker()).await.unwrap().is_none());
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 0);
    }

    #[tokio::test]
    async fn test_requeue_releases_claim_of_finished_job() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 2).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();
        start(&queue, &job.id).await;
        queue
            .ledger()
            .transition(&job.id, Transition::finish(JobResult::artifact("out")))
            .await
            .unwrap();

        let report = queue.requeue_worker(&worker()).await.unwrap();
        assert_eq!(report.skipped, vec![job.id.clone()]);
        assert_eq!(report.released_gpu, 2);
        assert_eq!(state(&queue, &job.id).await.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_queued_frees_reservation() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let pending = submit(&queue, 1).await;
        let admitted = submit(&queue, 2).await;

        // Admit only the 2-cost job by taking the first one out of the queue
        let cancelled = queue.cancel_queued(&pending.id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        queue.try_admit(&worker()).await.unwrap().unwrap();

        let cancelled = queue.cancel_queued(&admitted.id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(queue.slot(&worker()).await.unwrap().reserved_gpu, 0);
        assert_eq!(queue.queue_len().await.unwrap(), 0);

        assert!(matches!(
            queue.cancel_queued(&admitted.id).await,
            Err(QueueError::NotQueued { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_is_not_queued() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        let job = submit(&queue, 1).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();
        start(&queue, &job.id).await;

        assert!(matches!(
            queue.cancel_queued(&job.id).await,
            Err(QueueError::NotQueued {
                state: JobState::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_entries_dropped_lazily() {
        let queue = queue(AdmissionPolicy::StrictFifo);
        queue.register_worker(&worker(), 4).await.unwrap();
        let first = submit(&queue, 1).await;
        let second = submit(&queue, 1).await;

        // Cancel behind the queue's back
        queue
            .ledger()
            .transition(&first.id, Transition::new(JobState::Pending, JobState::Cancelled))
            .await
            .unwrap();

        let admitted = queue.try_admit(&worker()).await.unwrap().unwrap();
        assert_eq!(admitted.id, second.id);
        assert_eq!(queue.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_refresh_keeps_reservation() {
        let queue = queue(AdmissionPolicy::FirstFit);
        queue.register_worker(&worker(), 4).await.unwrap();
        submit(&queue, 3).await;
        queue.try_admit(&worker()).await.unwrap().unwrap();

        queue.register_worker(&worker(), 6).await.unwrap();
        let slot = queue.slot(&worker()).await.unwrap();
        assert_eq!(slot.total_gpu_capacity, 6);
        assert_eq!(slot.reserved_gpu, 3);
        assert!(queue.register_worker(&worker(), 0).await.is_err());
    }
}
