//! Worker metrics.

use metrics::{counter, gauge, histogram};
use vgate_models::{HealthStatus, JobResult};

pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "vgate_jobs_started_total";
    /// Labelled by `outcome` (succeeded or the failure kind).
    pub const JOBS_FINISHED_TOTAL: &str = "vgate_jobs_finished_total";
    pub const JOB_DURATION_SECONDS: &str = "vgate_job_duration_seconds";
    pub const JOBS_IN_FLIGHT: &str = "vgate_jobs_in_flight";
    pub const WORKER_RESTARTS_TOTAL: &str = "vgate_worker_restarts_total";
    /// 0 healthy, 1 degraded, 2 unresponsive.
    pub const WORKER_STATUS: &str = "vgate_worker_status";
}

pub fn record_started(worker: &str) {
    counter!(names::JOBS_STARTED_TOTAL, "worker" => worker.to_string()).increment(1);
}

pub fn record_finished(worker: &str, result: &JobResult, secs: f64) {
    let outcome = match result.failure_kind() {
        None => "succeeded",
        Some(kind) => kind.as_str(),
    };
    counter!(
        names::JOBS_FINISHED_TOTAL,
        "worker" => worker.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "worker" => worker.to_string()).record(secs);
}

pub fn record_in_flight(worker: &str, count: usize) {
    gauge!(names::JOBS_IN_FLIGHT, "worker" => worker.to_string()).set(count as f64);
}

pub fn record_restart(worker: &str) {
    counter!(names::WORKER_RESTARTS_TOTAL, "worker" => worker.to_string()).increment(1);
}

pub fn record_status(worker: &str, status: HealthStatus) {
    let value = match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Unresponsive => 2.0,
    };
    gauge!(names::WORKER_STATUS, "worker" => worker.to_string()).set(value);
}
