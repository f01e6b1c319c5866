//! Requeue consumer: turns `WorkerRestarted` events into requeue batches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use vgate_models::{WorkerEvent, WorkerId};

use crate::admission::{AdmissionQueue, RequeueReport};
use crate::error::{QueueError, QueueResult};
use crate::retry::{retry_async_if, FailureTracker, RetryConfig, RetryResult};

/// Consumes worker events and fixes job state for restarted workers.
///
/// A worker whose requeue fails stays outstanding and is retried every
/// `retry_interval` until it succeeds. The admission gate set by the
/// health monitor keeps its slot closed in the meantime.
pub struct RequeueConsumer {
    queue: Arc<AdmissionQueue>,
    events: mpsc::Receiver<WorkerEvent>,
    retry: RetryConfig,
    retry_interval: Duration,
    outstanding: BTreeSet<WorkerId>,
    failures: FailureTracker,
}

impl RequeueConsumer {
    pub fn new(queue: Arc<AdmissionQueue>, events: mpsc::Receiver<WorkerEvent>) -> Self {
        Self {
            queue,
            events,
            retry: RetryConfig::new("requeue_worker")
                .with_max_retries(5)
                .with_base_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(10)),
            retry_interval: Duration::from_secs(5),
            outstanding: BTreeSet::new(),
            failures: FailureTracker::new(3),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Workers whose requeue has not succeeded yet.
    pub fn outstanding(&self) -> &BTreeSet<WorkerId> {
        &self.outstanding
    }

    /// Handle a single event, retrying transient failures.
    ///
    /// A worker that still fails is kept for [`retry_outstanding`](Self::retry_outstanding).
    pub async fn handle(&mut self, event: &WorkerEvent) -> QueueResult<RequeueReport> {
        match event {
            WorkerEvent::WorkerRestarted { worker_id, at } => {
                info!(worker_id = %worker_id, restarted_at = %at, "Requeueing jobs of restarted worker");
                self.requeue(worker_id).await
            }
        }
    }

    /// One more requeue round for every outstanding worker.
    pub async fn retry_outstanding(&mut self) {
        let workers: Vec<WorkerId> = self.outstanding.iter().cloned().collect();
        for worker_id in workers {
            // Failures stay outstanding and are logged in requeue()
            let _ = self.requeue(&worker_id).await;
        }
    }

    async fn requeue(&mut self, worker_id: &WorkerId) -> QueueResult<RequeueReport> {
        let queue = Arc::clone(&self.queue);
        let outcome = retry_async_if(
            &self.retry,
            || queue.requeue_worker(worker_id),
            |e: &QueueError| e.is_retryable(),
        )
        .await;

        match outcome {
            RetryResult::Success(report) => {
                if self.outstanding.remove(worker_id) {
                    info!(worker_id = %worker_id, "Outstanding requeue completed");
                }
                self.failures.record_success();
                Ok(report)
            }
            RetryResult::Failed { error, attempts } => {
                self.outstanding.insert(worker_id.clone());
                if self.failures.record_failure() {
                    error!(
                        worker_id = %worker_id,
                        attempts,
                        error = %error,
                        "Requeue failed; will retry"
                    );
                }
                Err(error)
            }
        }
    }

    /// Run until the channel closes or shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Requeue consumer started");

        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        warn!("Worker event channel closed");
                        break;
                    };
                    // Failures stay outstanding for the retry tick
                    let _ = self.handle(&event).await;
                }
                _ = ticker.tick(), if !self.outstanding.is_empty() => {
                    self.retry_outstanding().await;
                }
            }
        }

        if !self.outstanding.is_empty() {
            warn!(workers = ?self.outstanding, "Stopping with requeues outstanding");
        }
        info!("Requeue consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vgate_ledger::{JobLedger, JobStream, LedgerError, LedgerResult, MemoryLedger, Transition};
    use vgate_models::{Job, JobId, JobPayload, JobState, Operation, TransitionRecord};

    /// Memory ledger whose transitions fail while `down` is set.
    #[derive(Default)]
    struct FlakyLedger {
        inner: MemoryLedger,
        down: AtomicBool,
    }

    #[async_trait]
    impl JobLedger for FlakyLedger {
        async fn create(&self, payload: JobPayload, gpu_cost: u32) -> LedgerResult<Job> {
            self.inner.create(payload, gpu_cost).await
        }

        async fn transition(&self, id: &JobId, transition: Transition) -> LedgerResult<Job> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.transition(id, transition).await
        }

        async fn get(&self, id: &JobId) -> LedgerResult<Job> {
            self.inner.get(id).await
        }

        fn list_by_state(&self, state: JobState) -> JobStream {
            self.inner.list_by_state(state)
        }

        async fn history(&self, id: &JobId) -> LedgerResult<Vec<TransitionRecord>> {
            self.inner.history(id).await
        }

        async fn ping(&self) -> LedgerResult<()> {
            self.inner.ping().await
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new("requeue_worker")
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(1))
    }

    async fn running_job(queue: &AdmissionQueue, worker: &WorkerId) -> Job {
        queue.register_worker(worker, 2).await.unwrap();
        let job = queue
            .ledger()
            .create(JobPayload::new(Operation::Segment, "/media/in.mp4"), 2)
            .await
            .unwrap();
        queue.enqueue(&job).await.unwrap();
        queue.try_admit(worker).await.unwrap().unwrap();
        queue.ledger().transition(&job.id, Transition::start()).await.unwrap()
    }

    #[tokio::test]
    async fn test_restart_event_requeues_jobs() {
        let queue = Arc::new(AdmissionQueue::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryStore::new()),
            QueueConfig::memory(),
        ));
        let worker = WorkerId::from("gpu-0");
        let job = running_job(&queue, &worker).await;

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = RequeueConsumer::new(Arc::clone(&queue), rx);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        tx.send(WorkerEvent::restarted(worker.clone())).await.unwrap();

        let mut requeued = false;
        for _ in 0..100 {
            let current = queue.ledger().get(&job.id).await.unwrap();
            if current.state == JobState::Pending {
                assert_eq!(current.attempt_count, 1);
                requeued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(requeued, "job was not requeued");
        assert_eq!(queue.slot(&worker).await.unwrap().reserved_gpu, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_requeue_is_retried_until_it_succeeds() {
        let ledger = Arc::new(FlakyLedger::default());
        let queue = Arc::new(AdmissionQueue::new(
            Arc::clone(&ledger) as Arc<dyn JobLedger>,
            Arc::new(MemoryStore::new()),
            QueueConfig::memory(),
        ));
        let worker = WorkerId::from("gpu-0");
        let job = running_job(&queue, &worker).await;

        queue.hold_for_requeue(&worker).await;
        ledger.down.store(true, Ordering::SeqCst);

        let (_tx, rx) = mpsc::channel(8);
        let mut consumer = RequeueConsumer::new(Arc::clone(&queue), rx).with_retry(fast_retry());

        let err = consumer
            .handle(&WorkerEvent::restarted(worker.clone()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(consumer.outstanding().contains(&worker));

        // The slot stays closed while the requeue is outstanding
        assert!(queue.awaiting_requeue(&worker).await);
        assert_eq!(queue.ledger().get(&job.id).await.unwrap().state, JobState::Running);

        consumer.retry_outstanding().await;
        assert!(consumer.outstanding().contains(&worker));

        ledger.down.store(false, Ordering::SeqCst);
        consumer.retry_outstanding().await;

        assert!(consumer.outstanding().is_empty());
        assert!(!queue.awaiting_requeue(&worker).await);
        let requeued = queue.ledger().get(&job.id).await.unwrap();
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(queue.slot(&worker).await.unwrap().reserved_gpu, 0);
    }

    #[tokio::test]
    async fn test_run_loop_retries_outstanding_workers() {
        let ledger = Arc::new(FlakyLedger::default());
        let queue = Arc::new(AdmissionQueue::new(
            Arc::clone(&ledger) as Arc<dyn JobLedger>,
            Arc::new(MemoryStore::new()),
            QueueConfig::memory(),
        ));
        let worker = WorkerId::from("gpu-0");
        let job = running_job(&queue, &worker).await;
        ledger.down.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = RequeueConsumer::new(Arc::clone(&queue), rx)
            .with_retry(fast_retry())
            .with_retry_interval(Duration::from_millis(20));
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        tx.send(WorkerEvent::restarted(worker.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.ledger().get(&job.id).await.unwrap().state, JobState::Running);

        ledger.down.store(false, Ordering::SeqCst);

        let mut requeued = false;
        for _ in 0..100 {
            if queue.ledger().get(&job.id).await.unwrap().state == JobState::Pending {
                requeued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(requeued, "outstanding requeue was never retried");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
