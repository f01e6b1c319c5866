//! GPU admission queue.
//!
//! This crate provides:
//! - FIFO admission of Pending jobs against per-worker GPU capacity
//! - Atomic reservations (claims) in Redis or in memory
//! - Batch requeue of a restarted worker's jobs, driven by `WorkerEvent`s
//! - Retry helpers with exponential backoff

pub mod admission;
pub mod config;
pub mod error;
pub mod metrics;
pub mod recovery;
pub mod retry;
pub mod store;

pub use admission::{AdmissionQueue, RequeueReport};
pub use config::{AdmissionPolicy, QueueConfig, StoreBackend};
pub use error::{QueueError, QueueResult};
pub use recovery::RequeueConsumer;
pub use retry::{retry_async_if, FailureTracker, RetryConfig, RetryResult};
pub use store::{CapacityOutcome, MemoryStore, RedisStore, ReservationStore, ReserveOutcome};
