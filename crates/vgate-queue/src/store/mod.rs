//! Reservation stores: worker slots, claims, the pending queue and the
//! admission lock.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use vgate_models::{Claim, HealthStatus, JobId, WorkerId, WorkerSlot};

use crate::error::QueueResult;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Result of a conditional reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Capacity reserved and claim recorded
    Reserved,
    /// Not enough remaining capacity; nothing changed
    Insufficient,
    /// The job already holds a claim; nothing changed
    AlreadyClaimed,
    /// No slot registered for the worker
    UnknownWorker,
}

/// Result of a capacity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityOutcome {
    /// Slot created or capacity updated
    Set,
    /// The slot holds more than the requested capacity; nothing changed
    BelowReserved { reserved: u32 },
}

/// Atomic primitives the admission queue is built on.
///
/// Every method is individually atomic. Multi-step sequences are serialized
/// by the caller through [`ReservationStore::try_lock`].
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Create the slot or overwrite its capacity, keeping the reservation.
    ///
    /// Never lowers the capacity below the current reservation.
    async fn set_capacity(&self, worker: &WorkerId, capacity: u32) -> QueueResult<CapacityOutcome>;

    /// Returns `false` if the worker has no slot.
    async fn set_health(&self, worker: &WorkerId, status: HealthStatus) -> QueueResult<bool>;

    async fn slot(&self, worker: &WorkerId) -> QueueResult<Option<WorkerSlot>>;

    async fn slots(&self) -> QueueResult<Vec<WorkerSlot>>;

    /// Reserve `claim.gpu_cost` on the claim's worker if it fits, recording
    /// the claim in the same step.
    async fn try_reserve(&self, claim: &Claim) -> QueueResult<ReserveOutcome>;

    /// Consume the job's claim and give its capacity back.
    ///
    /// Returns `None` if the job holds no claim.
    async fn release(&self, job_id: &JobId) -> QueueResult<Option<Claim>>;

    async fn claim(&self, job_id: &JobId) -> QueueResult<Option<Claim>>;

    async fn claims_for(&self, worker: &WorkerId) -> QueueResult<Vec<Claim>>;

    /// Append to the pending queue; returns the 1-based position.
    async fn push_pending(&self, job_id: &JobId) -> QueueResult<u64>;

    /// Up to `limit` queued job ids, oldest first.
    async fn pending(&self, limit: usize) -> QueueResult<Vec<JobId>>;

    /// Returns `false` if the job was not queued.
    async fn remove_pending(&self, job_id: &JobId) -> QueueResult<bool>;

    async fn pending_len(&self) -> QueueResult<u64>;

    /// Take the named lock if free. Returns the holder token.
    async fn try_lock(&self, name: &str, ttl: Duration) -> QueueResult<Option<String>>;

    /// Release the named lock if `token` still holds it.
    async fn unlock(&self, name: &str, token: &str) -> QueueResult<bool>;

    async fn ping(&self) -> QueueResult<()>;
}
