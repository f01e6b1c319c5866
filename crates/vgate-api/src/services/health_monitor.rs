//! Worker health monitor and autoheal loop.
//!
//! Each round probes every monitored worker. A worker that fails
//! `unhealthy_threshold` probes in a row is taken out of admission, restarted,
//! and announced with a `WorkerRestarted` event so its jobs get requeued.
//! Its slot reopens on the first healthy probe after that requeue succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;
use vgate_models::{HealthStatus, ProbeResult, WorkerEvent, WorkerId};
use vgate_queue::AdmissionQueue;
use vgate_worker::WorkerSupervisor;

use crate::config::HealthConfig;
use crate::error::{ApiError, ApiResult};
use crate::metrics;

// ============================================================================
// Probes
// ============================================================================

/// Liveness check of one worker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, worker: &WorkerId) -> ProbeResult;
}

/// Probes an in-process supervisor through its heartbeat.
pub struct SupervisorProbe {
    supervisor: Arc<WorkerSupervisor>,
}

impl SupervisorProbe {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl HealthProbe for SupervisorProbe {
    async fn probe(&self, _worker: &WorkerId) -> ProbeResult {
        match self.supervisor.status().await {
            HealthStatus::Unresponsive => ProbeResult::Unhealthy,
            HealthStatus::Healthy | HealthStatus::Degraded => ProbeResult::Healthy,
        }
    }
}

/// Probes an externally managed worker over HTTP.
///
/// Anything but a 2xx answer within the timeout counts as unhealthy.
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(url: Url, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::config(format!("failed to build probe client: {}", e)))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, worker: &WorkerId) -> ProbeResult {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) if response.status().is_success() => ProbeResult::Healthy,
            Ok(response) => {
                debug!(worker_id = %worker, status = %response.status(), "Probe answered with an error status");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(worker_id = %worker, error = %e, "Probe request failed");
                ProbeResult::Unhealthy
            }
        }
    }
}

// ============================================================================
// Restarts
// ============================================================================

/// Forces a worker back into a clean state.
#[async_trait]
pub trait WorkerRestarter: Send + Sync {
    async fn restart(&self, worker: &WorkerId) -> ApiResult<()>;
}

// ============================================================================
// Monitor
// ============================================================================

/// What one probe round did for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Healthy, but the slot stays closed until the requeue lands
    AwaitingRequeue,
    Unhealthy { consecutive: u32 },
    Restarted,
    RestartFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCheck {
    pub worker_id: WorkerId,
    pub outcome: ProbeOutcome,
}

pub struct HealthMonitor {
    queue: Arc<AdmissionQueue>,
    restarter: Arc<dyn WorkerRestarter>,
    events: mpsc::Sender<WorkerEvent>,
    config: HealthConfig,
    targets: Vec<(WorkerId, Arc<dyn HealthProbe>)>,
    failures: Mutex<HashMap<WorkerId, u32>>,
}

impl HealthMonitor {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        restarter: Arc<dyn WorkerRestarter>,
        events: mpsc::Sender<WorkerEvent>,
        config: HealthConfig,
    ) -> Self {
        Self {
            queue,
            restarter,
            events,
            config,
            targets: Vec::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor `worker` with `probe`.
    pub fn with_worker(mut self, worker: WorkerId, probe: Arc<dyn HealthProbe>) -> Self {
        self.targets.push((worker, probe));
        self
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.targets.iter().map(|(worker, _)| worker)
    }

    pub async fn consecutive_failures(&self, worker: &WorkerId) -> u32 {
        self.failures.lock().await.get(worker).copied().unwrap_or(0)
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Health monitor is disabled");
            return;
        }

        info!(
            workers = self.targets.len(),
            interval_secs = self.config.probe_interval.as_secs(),
            threshold = self.config.unhealthy_threshold,
            "Health monitor started"
        );

        let mut ticker = interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// Probe every worker once and act on the results.
    pub async fn check_once(&self) -> Vec<WorkerCheck> {
        let probes = self
            .targets
            .iter()
            .map(|(worker, probe)| async move { (worker, probe.probe(worker).await) });
        let results = join_all(probes).await;

        let mut checks = Vec::with_capacity(results.len());
        for (worker, result) in results {
            metrics::record_probe(worker.as_str(), result.is_healthy());
            let outcome = match result {
                ProbeResult::Healthy => self.on_healthy(worker).await,
                ProbeResult::Unhealthy => self.on_unhealthy(worker).await,
            };
            checks.push(WorkerCheck {
                worker_id: worker.clone(),
                outcome,
            });
        }
        checks
    }

    async fn on_healthy(&self, worker: &WorkerId) -> ProbeOutcome {
        let previous = self
            .failures
            .lock()
            .await
            .insert(worker.clone(), 0)
            .unwrap_or(0);

        if self.queue.awaiting_requeue(worker).await {
            debug!(worker_id = %worker, "Worker healthy, waiting for its requeue");
            return ProbeOutcome::AwaitingRequeue;
        }

        match self.queue.slot(worker).await {
            Ok(slot) if slot.health_status != HealthStatus::Healthy => {
                match self.queue.set_health(worker, HealthStatus::Healthy).await {
                    Ok(()) => info!(
                        worker_id = %worker,
                        was = %slot.health_status,
                        "Worker healthy again, admissions resumed"
                    ),
                    Err(e) => warn!(worker_id = %worker, error = %e, "Failed to mark worker healthy"),
                }
            }
            Ok(_) => {
                if previous > 0 {
                    info!(worker_id = %worker, failed_probes = previous, "Worker probe recovered");
                }
            }
            Err(e) => warn!(worker_id = %worker, error = %e, "Failed to read worker slot"),
        }

        ProbeOutcome::Healthy
    }

    async fn on_unhealthy(&self, worker: &WorkerId) -> ProbeOutcome {
        let consecutive = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(worker.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let threshold = self.config.unhealthy_threshold;
        if consecutive < threshold {
            warn!(worker_id = %worker, consecutive, threshold, "Worker probe failed");
            return ProbeOutcome::Unhealthy { consecutive };
        }

        warn!(worker_id = %worker, consecutive, "Worker unhealthy, forcing restart");

        // Stop admissions first; the slot stays out until a healthy probe
        if let Err(e) = self.queue.set_health(worker, HealthStatus::Unresponsive).await {
            error!(worker_id = %worker, error = %e, "Failed to mark worker unresponsive");
        }

        if let Err(e) = self.restarter.restart(worker).await {
            error!(worker_id = %worker, error = %e, "Worker restart failed");
            return ProbeOutcome::RestartFailed;
        }

        self.failures.lock().await.insert(worker.clone(), 0);
        metrics::record_autoheal(worker.as_str());
        self.queue.hold_for_requeue(worker).await;

        if self.events.send(WorkerEvent::restarted(worker.clone())).await.is_err() {
            error!(worker_id = %worker, "Worker event channel closed, jobs were not requeued");
        }

        ProbeOutcome::Restarted
    }
}
