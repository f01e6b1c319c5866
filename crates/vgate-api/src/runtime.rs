//! Process wiring: backends, supervisors, the health monitor and the requeue
//! consumer.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use vgate_queue::{AdmissionQueue, RequeueConsumer};
use vgate_worker::{WorkerCapability, WorkerSupervisor};

use crate::config::OrchestratorConfig;
use crate::error::ApiResult;
use crate::orchestrator::Orchestrator;
use crate::services::{HealthMonitor, HealthProbe, HttpProbe, SupervisorProbe, WorkerRestarter};

/// Buffered restart events between the monitor and the requeue consumer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The assembled orchestrator and its background services, not yet running.
pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    monitor: HealthMonitor,
    consumer: RequeueConsumer,
}

impl Runtime {
    /// Connect the backends and build every component.
    ///
    /// Jobs a previous process left Admitted or Running are requeued before
    /// the workers are registered, so a lowered capacity applies to a drained
    /// slot, and before any supervisor exists.
    pub async fn build(
        config: &OrchestratorConfig,
        capability: Arc<dyn WorkerCapability>,
    ) -> ApiResult<Self> {
        config.validate()?;

        let ledger = vgate_ledger::connect(&config.ledger).await?;
        let queue = Arc::new(AdmissionQueue::from_config(ledger, config.queue.clone())?);
        queue.ping().await?;

        for spec in &config.workers {
            queue.requeue_worker(&spec.id).await?;
            queue.register_worker(&spec.id, spec.gpu_capacity).await?;
        }

        let supervisors: Vec<Arc<WorkerSupervisor>> = config
            .workers
            .iter()
            .map(|spec| {
                WorkerSupervisor::new(
                    spec.id.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&capability),
                    config.worker.clone(),
                )
            })
            .collect();
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&queue), supervisors));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let consumer = RequeueConsumer::new(Arc::clone(&queue), events_rx);

        let restarter: Arc<dyn WorkerRestarter> = orchestrator.clone();
        let mut monitor = HealthMonitor::new(queue, restarter, events_tx, config.health.clone());
        for spec in &config.workers {
            let probe: Arc<dyn HealthProbe> = match (&spec.probe_url, orchestrator.supervisor(&spec.id)) {
                (Some(url), _) => Arc::new(HttpProbe::new(url.clone(), config.health.probe_timeout)?),
                (None, Some(supervisor)) => Arc::new(SupervisorProbe::new(Arc::clone(supervisor))),
                (None, None) => continue,
            };
            monitor = monitor.with_worker(spec.id.clone(), probe);
        }

        info!(
            workers = config.workers.len(),
            ledger = ?config.ledger.backend,
            store = ?config.queue.backend,
            policy = config.queue.policy.as_str(),
            "Orchestrator assembled"
        );

        Ok(Self {
            orchestrator,
            monitor,
            consumer,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn into_parts(self) -> (Arc<Orchestrator>, HealthMonitor, RequeueConsumer) {
        (self.orchestrator, self.monitor, self.consumer)
    }

    /// Spawn the supervisors, the health monitor and the requeue consumer.
    ///
    /// Every task ends once `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (Arc<Orchestrator>, Vec<JoinHandle<()>>) {
        let mut handles: Vec<JoinHandle<()>> = self
            .orchestrator
            .supervisors()
            .map(|supervisor| tokio::spawn(Arc::clone(supervisor).run(shutdown.clone())))
            .collect();

        handles.push(tokio::spawn(self.consumer.run(shutdown.clone())));
        handles.push(tokio::spawn(self.monitor.run(shutdown)));

        (self.orchestrator, handles)
    }
}
