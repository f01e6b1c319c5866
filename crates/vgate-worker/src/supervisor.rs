//! Worker supervisor.
//!
//! One supervisor drives one GPU worker: a poll loop admits work onto the
//! worker's slot, every admitted job runs as its own task, and the outcome
//! is recorded through the ledger before the reservation is released.
//!
//! Ledger writes that fail with a backend error are kept as unsettled work
//! and retried on every poll tick; the worker reports Degraded until they
//! land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use vgate_ledger::{LedgerError, Transition};
use vgate_models::{FailureKind, HealthStatus, Job, JobId, JobResult, Operation, WorkerId};
use vgate_queue::{
    retry_async_if, AdmissionQueue, FailureTracker, QueueError, RetryConfig, RetryResult,
};

use crate::capability::WorkerCapability;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Handle to a dispatched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    operation: Operation,
    generation: u64,
    started: Instant,
    cancel: Arc<watch::Sender<bool>>,
    finished: watch::Receiver<bool>,
    abort: AbortHandle,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Supervisor generation the job was dispatched under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the job's outcome has been recorded or its task is gone.
    pub async fn wait(&self) {
        wait_finished(self.finished.clone()).await;
    }
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub worker_id: WorkerId,
    pub status: HealthStatus,
    pub polling: bool,
    pub generation: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_age_ms: Option<u64>,
    pub in_flight: Vec<JobId>,
    /// Jobs whose ledger write is still being retried
    pub unsettled: Vec<JobId>,
}

/// Result of writing a job's outcome to the ledger.
enum Settlement {
    Recorded,
    /// The job left Running; whoever moved it owns the claim
    Superseded,
    Unavailable(LedgerError),
}

/// Ledger work that failed and is retried from the poll loop.
#[derive(Debug, Clone)]
enum Unsettled {
    /// Terminal outcome not yet recorded; the claim is still held
    Outcome {
        result: JobResult,
        operation: Operation,
        started: Instant,
    },
    /// Admitted job whose start was not recorded; goes back to the queue
    Unstarted,
}

#[derive(Debug, Clone)]
struct UnsettledEntry {
    generation: u64,
    work: Unsettled,
}

struct PollLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Supervises one worker.
pub struct WorkerSupervisor {
    worker_id: WorkerId,
    queue: Arc<AdmissionQueue>,
    capability: Arc<dyn WorkerCapability>,
    config: WorkerConfig,
    epoch: Instant,
    /// Milliseconds since `epoch` plus one; zero means no heartbeat yet
    last_beat: AtomicU64,
    generation: AtomicU64,
    consecutive_failures: AtomicU32,
    tasks: Mutex<HashMap<JobId, JobHandle>>,
    unsettled: Mutex<HashMap<JobId, UnsettledEntry>>,
    poll: Mutex<Option<PollLoop>>,
}

impl WorkerSupervisor {
    pub fn new(
        worker_id: WorkerId,
        queue: Arc<AdmissionQueue>,
        capability: Arc<dyn WorkerCapability>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            queue,
            capability,
            config,
            epoch: Instant::now(),
            last_beat: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            tasks: Mutex::new(HashMap::new()),
            unsettled: Mutex::new(HashMap::new()),
            poll: Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Start an Admitted job on this worker.
    ///
    /// Fails with a conflict if the job left Admitted (cancelled or requeued)
    /// before it could start. If the ledger is unavailable the job is handed
    /// back to the queue from a later poll tick.
    pub async fn dispatch(self: &Arc<Self>, job: Job) -> WorkerResult<JobHandle> {
        if job.worker_id.as_ref() != Some(&self.worker_id) {
            return Err(WorkerError::NotAssigned {
                id: job.id,
                worker: self.worker_id.clone(),
            });
        }

        let generation = self.generation();
        let running = match self.queue.ledger().transition(&job.id, Transition::start()).await {
            Ok(running) => running,
            Err(e) if e.is_backend() => {
                self.defer(&job.id, generation, Unsettled::Unstarted).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let logger = JobLogger::new(&running.id, &self.worker_id, running.payload.operation);
        let span = logger.create_span();

        // Held across spawn so the task cannot deregister before it is registered
        let mut tasks = self.tasks.lock().await;

        let id = running.id.clone();
        let operation = running.payload.operation;
        let this = Arc::clone(self);
        let task_cancel = Arc::clone(&cancel_tx);
        let task = tokio::spawn(
            async move {
                this.execute(running, generation, task_cancel, cancel_rx, logger)
                    .await;
                let _ = finished_tx.send(true);
            }
            .instrument(span),
        );

        let handle = JobHandle {
            job_id: id.clone(),
            operation,
            generation,
            started: Instant::now(),
            cancel: cancel_tx,
            finished: finished_rx,
            abort: task.abort_handle(),
        };
        tasks.insert(id, handle.clone());
        metrics::record_in_flight(self.worker_id.as_str(), tasks.len());

        Ok(handle)
    }

    async fn execute(
        self: Arc<Self>,
        job: Job,
        generation: u64,
        cancel_tx: Arc<watch::Sender<bool>>,
        cancel_rx: watch::Receiver<bool>,
        logger: JobLogger,
    ) {
        let started = Instant::now();
        logger.log_start(job.attempt_count, job.gpu_cost);
        metrics::record_started(self.worker_id.as_str());

        let capability = Arc::clone(&self.capability);
        let id = job.id.clone();
        let payload = job.payload.clone();
        let exec_cancel = cancel_rx.clone();
        let mut exec = tokio::spawn(
            async move { capability.execute(&id, &payload, exec_cancel).await }.in_current_span(),
        );
        let _guard = AbortOnDrop(exec.abort_handle());

        let result = match tokio::time::timeout(self.config.job_timeout, &mut exec).await {
            Ok(joined) => classify(joined, *cancel_rx.borrow()),
            Err(_) => {
                logger.log_warning("job timed out, cancelling");
                let _ = cancel_tx.send(true);
                if tokio::time::timeout(self.config.cancel_grace, &mut exec)
                    .await
                    .is_err()
                {
                    exec.abort();
                }
                JobResult::error(
                    FailureKind::Timeout,
                    format!(
                        "exceeded job timeout of {}s",
                        self.config.job_timeout.as_secs()
                    ),
                )
            }
        };

        if self.generation() != generation {
            debug!(job_id = %job.id, "Supervisor restarted while the job ran, dropping outcome");
            return;
        }

        let settlement = self
            .finish(&job.id, &result, &logger, started.elapsed(), &outcome_retry())
            .await;
        if let Settlement::Unavailable(error) = settlement {
            logger.log_error(&format!("failed to record outcome, will retry: {}", error));
            let work = Unsettled::Outcome {
                result,
                operation: job.payload.operation,
                started,
            };
            self.defer(&job.id, generation, work).await;
        }
        self.forget(&job.id, generation).await;
    }

    /// Record a terminal outcome, then release the claim.
    async fn finish(
        &self,
        id: &JobId,
        result: &JobResult,
        logger: &JobLogger,
        elapsed: Duration,
        retry: &RetryConfig,
    ) -> Settlement {
        let recorded = retry_async_if(
            retry,
            || self.queue.ledger().transition(id, Transition::finish(result.clone())),
            |e: &LedgerError| e.is_backend(),
        )
        .await;

        let job = match recorded {
            RetryResult::Success(job) => job,
            RetryResult::Failed { error, .. } if error.is_backend() => {
                return Settlement::Unavailable(error);
            }
            RetryResult::Failed { error, .. } => {
                logger.log_warning(&format!("outcome not recorded: {}", error));
                return Settlement::Superseded;
            }
        };

        let release = retry_async_if(retry, || self.queue.release(id), QueueError::is_retryable).await;
        if let RetryResult::Failed { error, .. } = release {
            // A terminal job's claim is swept by the next requeue pass
            logger.log_error(&format!("failed to release claim: {}", error));
        }

        match result.failure_kind() {
            None => self.consecutive_failures.store(0, Ordering::SeqCst),
            Some(FailureKind::Cancelled) => {}
            Some(kind) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                logger.log_error(&format!("{} (consecutive failures: {})", kind, failures));
            }
        }

        metrics::record_finished(self.worker_id.as_str(), result, elapsed.as_secs_f64());
        logger.log_completion(job.state.as_str(), elapsed);
        Settlement::Recorded
    }

    async fn defer(&self, id: &JobId, generation: u64, work: Unsettled) {
        debug!(job_id = %id, work = ?work, "Ledger write deferred to the poll loop");
        self.unsettled
            .lock()
            .await
            .insert(id.clone(), UnsettledEntry { generation, work });
    }

    /// Retry every deferred ledger write once.
    ///
    /// Returns how many are still unsettled.
    pub async fn settle_unsettled(&self) -> usize {
        let entries: Vec<(JobId, UnsettledEntry)> = self
            .unsettled
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        let generation = self.generation();
        let single = RetryConfig::new("record_outcome").with_max_retries(0);

        for (id, entry) in entries {
            let settled = if entry.generation != generation {
                true
            } else {
                match entry.work {
                    Unsettled::Outcome {
                        result,
                        operation,
                        started,
                    } => {
                        let logger = JobLogger::new(&id, &self.worker_id, operation);
                        match self.finish(&id, &result, &logger, started.elapsed(), &single).await {
                            Settlement::Unavailable(e) => {
                                debug!(job_id = %id, error = %e, "Outcome still unrecorded");
                                false
                            }
                            Settlement::Recorded | Settlement::Superseded => true,
                        }
                    }
                    Unsettled::Unstarted => {
                        match self.queue.return_job(&self.worker_id, &id).await {
                            Ok(_) => {
                                info!(job_id = %id, worker_id = %self.worker_id, "Unstarted job returned to the queue");
                                true
                            }
                            Err(e) if e.is_retryable() => {
                                debug!(job_id = %id, error = %e, "Job still not returned");
                                false
                            }
                            Err(e) => {
                                error!(job_id = %id, error = %e, "Giving up on returning job");
                                true
                            }
                        }
                    }
                }
            };

            if settled {
                let mut unsettled = self.unsettled.lock().await;
                if unsettled.get(&id).is_some_and(|e| e.generation == entry.generation) {
                    unsettled.remove(&id);
                }
            }
        }

        self.unsettled.lock().await.len()
    }

    pub async fn unsettled(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.unsettled.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn forget(&self, id: &JobId, generation: u64) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(id).is_some_and(|h| h.generation == generation) {
            tasks.remove(id);
        }
        metrics::record_in_flight(self.worker_id.as_str(), tasks.len());
    }

    /// Handle of a job currently running here.
    pub async fn handle(&self, id: &JobId) -> Option<JobHandle> {
        self.tasks.lock().await.get(id).cloned()
    }

    pub async fn in_flight(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a running job.
    ///
    /// The task is signalled and given `cancel_grace` to stop on its own;
    /// after that it is aborted and the cancellation recorded here.
    pub async fn cancel(&self, handle: &JobHandle) -> WorkerResult<()> {
        let _ = handle.cancel.send(true);

        let grace = self.config.cancel_grace;
        if tokio::time::timeout(grace, wait_finished(handle.finished.clone()))
            .await
            .is_ok()
        {
            return Ok(());
        }

        handle.abort.abort();
        self.forget(&handle.job_id, handle.generation).await;

        let logger = JobLogger::new(&handle.job_id, &self.worker_id, handle.operation);
        logger.log_warning(&format!(
            "did not stop within {}s of cancellation, aborted",
            grace.as_secs()
        ));
        let result = JobResult::error(FailureKind::Cancelled, "cancelled; aborted after grace period");
        let settlement = self
            .finish(&handle.job_id, &result, &logger, handle.started.elapsed(), &outcome_retry())
            .await;
        if let Settlement::Unavailable(error) = settlement {
            logger.log_error(&format!("failed to record cancellation, will retry: {}", error));
            let work = Unsettled::Outcome {
                result,
                operation: handle.operation,
                started: handle.started,
            };
            self.defer(&handle.job_id, handle.generation, work).await;
        }
        Ok(())
    }

    /// Cancel by job id.
    pub async fn cancel_job(&self, id: &JobId) -> WorkerResult<()> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| WorkerError::NotRunning(id.clone()))?;
        self.cancel(&handle).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    fn beat(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_beat.store(now + 1, Ordering::SeqCst);
    }

    fn heartbeat_age(&self) -> Option<Duration> {
        match self.last_beat.load(Ordering::SeqCst) {
            0 => None,
            beat => Some(
                self.epoch
                    .elapsed()
                    .saturating_sub(Duration::from_millis(beat - 1)),
            ),
        }
    }

    async fn is_polling(&self) -> bool {
        self.poll
            .lock()
            .await
            .as_ref()
            .is_some_and(|poll| !poll.handle.is_finished())
    }

    fn evaluate(&self, polling: bool, unsettled: bool) -> HealthStatus {
        let Some(age) = self.heartbeat_age().filter(|_| polling) else {
            return HealthStatus::Unresponsive;
        };
        if age > self.config.heartbeat_unresponsive_after {
            return HealthStatus::Unresponsive;
        }
        if unsettled
            || age > self.config.heartbeat_degraded_after
            || self.consecutive_failures() >= self.config.failure_threshold
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    /// Healthy, Degraded or Unresponsive, from the poll loop's heartbeat,
    /// the consecutive failure count and any unsettled ledger writes.
    pub async fn status(&self) -> HealthStatus {
        let polling = self.is_polling().await;
        let unsettled = !self.unsettled.lock().await.is_empty();
        self.evaluate(polling, unsettled)
    }

    pub async fn snapshot(&self) -> SupervisorStatus {
        let polling = self.is_polling().await;
        let unsettled = self.unsettled().await;
        SupervisorStatus {
            worker_id: self.worker_id.clone(),
            status: self.evaluate(polling, !unsettled.is_empty()),
            polling,
            generation: self.generation(),
            consecutive_failures: self.consecutive_failures(),
            heartbeat_age_ms: self.heartbeat_age().map(|age| age.as_millis() as u64),
            in_flight: self.in_flight().await,
            unsettled,
        }
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    /// Settle deferred ledger writes, then admit and dispatch until the
    /// worker is full or nothing fits.
    pub async fn poll_once(self: &Arc<Self>) -> WorkerResult<usize> {
        if !self.unsettled.lock().await.is_empty() {
            let remaining = self.settle_unsettled().await;
            if remaining > 0 {
                debug!(worker_id = %self.worker_id, remaining, "Ledger writes still unsettled");
            }
        }

        let mut dispatched = 0;

        while let Some(job) = self.queue.try_admit(&self.worker_id).await? {
            let id = job.id.clone();
            match self.dispatch(job).await {
                Ok(_) => dispatched += 1,
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %id, "Job left Admitted before dispatch");
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "Dispatch failed");
                    return Err(e);
                }
            }
        }

        Ok(dispatched)
    }

    async fn poll_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(5);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    self.beat();
                    match self.poll_once().await {
                        Ok(n) => {
                            failures.record_success();
                            if n > 0 {
                                debug!(worker_id = %self.worker_id, dispatched = n, "Dispatched jobs");
                            }
                        }
                        Err(WorkerError::Queue(QueueError::LockTimeout(_))) => {
                            debug!(worker_id = %self.worker_id, "Admission lock busy, retrying next tick");
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(worker_id = %self.worker_id, error = %e, "Poll failed");
                            }
                        }
                    }
                    metrics::record_status(self.worker_id.as_str(), self.status().await);
                }
            }
        }
    }

    /// Start the poll loop if it is not already running.
    pub async fn start(self: &Arc<Self>) {
        let mut poll = self.poll.lock().await;
        if poll.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        self.beat();
        let this = Arc::clone(self);
        let handle = tokio::spawn(this.poll_loop(stop_rx));
        *poll = Some(PollLoop { stop, handle });

        info!(
            worker_id = %self.worker_id,
            generation = self.generation(),
            "Worker poll loop started"
        );
    }

    /// Stop the poll loop, letting an in-progress poll finish.
    pub async fn stop(&self) {
        let Some(mut poll) = self.poll.lock().await.take() else {
            return;
        };
        let _ = poll.stop.send(true);
        if tokio::time::timeout(self.config.shutdown_timeout, &mut poll.handle)
            .await
            .is_err()
        {
            poll.handle.abort();
        }
        info!(worker_id = %self.worker_id, "Worker poll loop stopped");
    }

    /// Tear the worker down and bring it back.
    ///
    /// In-flight jobs are aborted without recording outcomes and unsettled
    /// ledger writes are dropped; their recovery belongs to the requeue pass
    /// that follows a restart.
    pub async fn restart(self: &Arc<Self>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stop().await;

        let aborted: Vec<JobHandle> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &aborted {
            let _ = handle.cancel.send(true);
            handle.abort.abort();
        }
        let dropped = {
            let mut unsettled = self.unsettled.lock().await;
            let count = unsettled.len();
            unsettled.clear();
            count
        };
        self.consecutive_failures.store(0, Ordering::SeqCst);

        metrics::record_restart(self.worker_id.as_str());
        metrics::record_in_flight(self.worker_id.as_str(), 0);
        warn!(
            worker_id = %self.worker_id,
            generation,
            aborted = aborted.len(),
            unsettled = dropped,
            "Worker restarted"
        );

        self.start().await;
        generation
    }

    /// Run until shutdown, then drain in-flight jobs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.start().await;

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        self.stop().await;

        let handles: Vec<JobHandle> = self.tasks.lock().await.values().cloned().collect();
        if !handles.is_empty() {
            info!(
                worker_id = %self.worker_id,
                in_flight = handles.len(),
                "Waiting for in-flight jobs to complete..."
            );
            let waits = handles.iter().map(|h| h.wait());
            if tokio::time::timeout(self.config.shutdown_timeout, join_all(waits))
                .await
                .is_err()
            {
                warn!(worker_id = %self.worker_id, "In-flight jobs still running at shutdown");
            }
        }

        info!(worker_id = %self.worker_id, "Worker supervisor stopped");
    }
}

fn outcome_retry() -> RetryConfig {
    RetryConfig::new("record_outcome")
        .with_max_retries(3)
        .with_base_delay(Duration::from_millis(100))
}

async fn wait_finished(mut finished: watch::Receiver<bool>) {
    while !*finished.borrow_and_update() {
        // Sender dropped: the task is gone
        if finished.changed().await.is_err() {
            return;
        }
    }
}

fn classify(joined: Result<Result<String, String>, JoinError>, cancelled: bool) -> JobResult {
    match joined {
        Ok(Ok(artifact)) => JobResult::artifact(artifact),
        Ok(Err(detail)) if cancelled => JobResult::error(FailureKind::Cancelled, detail),
        Ok(Err(detail)) => JobResult::error(FailureKind::TaskFailure, detail),
        Err(e) if e.is_panic() => JobResult::error(FailureKind::Crashed, panic_detail(e)),
        Err(_) => JobResult::error(FailureKind::Crashed, "task aborted"),
    }
}

fn panic_detail(err: JoinError) -> String {
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("task panicked: {}", message)
}
