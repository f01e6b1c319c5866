//! Durable job ledger.
//!
//! This crate provides:
//! - The `JobLedger` contract: create, compare-and-swap transitions, lookups,
//!   lazily paginated state listings and per-job transition history
//! - `PgLedger`, the PostgreSQL backend (sqlx)
//! - `MemoryLedger`, an in-process backend with identical semantics

pub mod config;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod transition;

use std::sync::Arc;

pub use config::{LedgerBackend, LedgerConfig};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{JobLedger, JobStream};
pub use memory::MemoryLedger;
pub use postgres::PgLedger;
pub use transition::Transition;

/// Build the configured ledger backend.
///
/// The postgres backend connects and creates its tables before returning.
pub async fn connect(config: &LedgerConfig) -> LedgerResult<Arc<dyn JobLedger>> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::with_page_size(config.page_size))),
        LedgerBackend::Postgres => {
            let ledger = PgLedger::connect(config).await?;
            ledger.init().await?;
            Ok(Arc::new(ledger))
        }
    }
}
