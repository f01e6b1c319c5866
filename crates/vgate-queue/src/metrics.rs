//! Admission metrics.

use metrics::{counter, gauge, histogram};
use vgate_models::WorkerSlot;

/// Metric name constants.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "vgate_jobs_enqueued_total";
    pub const JOBS_ADMITTED_TOTAL: &str = "vgate_jobs_admitted_total";
    pub const JOBS_REQUEUED_TOTAL: &str = "vgate_jobs_requeued_total";
    pub const JOBS_EXHAUSTED_TOTAL: &str = "vgate_jobs_attempts_exhausted_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "vgate_jobs_cancelled_total";
    pub const CLAIMS_RELEASED_TOTAL: &str = "vgate_claims_released_total";

    /// Reserved GPU units per worker.
    pub const GPU_RESERVED: &str = "vgate_gpu_reserved";
    /// Total GPU units per worker.
    pub const GPU_CAPACITY: &str = "vgate_gpu_capacity";
    pub const QUEUE_LENGTH: &str = "vgate_queue_length";

    pub const LOCK_WAIT_SECONDS: &str = "vgate_admission_lock_wait_seconds";
    pub const LOCK_TIMEOUTS_TOTAL: &str = "vgate_admission_lock_timeouts_total";
}

pub fn record_enqueued() {
    counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);
}

pub fn record_admitted(worker: &str) {
    counter!(names::JOBS_ADMITTED_TOTAL, "worker" => worker.to_string()).increment(1);
}

/// `from` is the state the job was requeued from.
pub fn record_requeued(worker: &str, from: &'static str) {
    counter!(
        names::JOBS_REQUEUED_TOTAL,
        "worker" => worker.to_string(),
        "from" => from
    )
    .increment(1);
}

pub fn record_exhausted() {
    counter!(names::JOBS_EXHAUSTED_TOTAL).increment(1);
}

pub fn record_cancelled() {
    counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
}

pub fn record_released(worker: &str) {
    counter!(names::CLAIMS_RELEASED_TOTAL, "worker" => worker.to_string()).increment(1);
}

/// Publish capacity and reservation for a slot.
pub fn record_slot(slot: &WorkerSlot) {
    let worker = slot.worker_id.to_string();
    gauge!(names::GPU_RESERVED, "worker" => worker.clone()).set(slot.reserved_gpu as f64);
    gauge!(names::GPU_CAPACITY, "worker" => worker).set(slot.total_gpu_capacity as f64);
}

pub fn record_queue_length(len: u64) {
    gauge!(names::QUEUE_LENGTH).set(len as f64);
}

pub fn record_lock_wait(secs: f64, acquired: bool) {
    histogram!(names::LOCK_WAIT_SECONDS).record(secs);
    if !acquired {
        counter!(names::LOCK_TIMEOUTS_TOTAL).increment(1);
    }
}
