//! The ledger contract.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use vgate_models::{Job, JobId, JobPayload, JobState, TransitionRecord};

use crate::error::{LedgerError, LedgerResult};
use crate::transition::Transition;

/// Lazy, finite stream of jobs.
pub type JobStream = BoxStream<'static, LedgerResult<Job>>;

/// Durable record of job existence and state history.
///
/// All state changes go through [`JobLedger::transition`], a compare-and-swap
/// on the recorded state.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Record a new Pending job.
    async fn create(&self, payload: JobPayload, gpu_cost: u32) -> LedgerResult<Job>;

    /// Commit `transition` if the job is still in `transition.from`.
    ///
    /// Returns the updated job, `Conflict` if the recorded state differs,
    /// `NotFound`, or `InvalidTransition` for edges outside the lifecycle.
    async fn transition(&self, id: &JobId, transition: Transition) -> LedgerResult<Job>;

    async fn get(&self, id: &JobId) -> LedgerResult<Job>;

    /// Stream every job in `state`, oldest first.
    ///
    /// Pages are read on demand; each call starts a fresh pass.
    fn list_by_state(&self, state: JobState) -> JobStream;

    /// Committed transitions for a job, in commit order.
    async fn history(&self, id: &JobId) -> LedgerResult<Vec<TransitionRecord>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> LedgerResult<()>;
}

/// Position after the last row of a page: `(created_at, id)`.
pub(crate) type Cursor = (DateTime<Utc>, JobId);

/// Keyset-paginated stream over `fetch(after, limit)`.
///
/// Ends when a page comes back shorter than `page_size`.
pub(crate) fn keyset_stream<F, Fut>(page_size: u32, fetch: F) -> JobStream
where
    F: Fn(Option<Cursor>, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LedgerResult<Vec<Job>>> + Send + 'static,
{
    let page_size = page_size.max(1);

    stream::try_unfold(
        (None::<Cursor>, false, fetch),
        move |(after, exhausted, fetch)| async move {
            if exhausted {
                return Ok::<_, LedgerError>(None);
            }

            let page = fetch(after, page_size).await?;
            let exhausted = page.len() < page_size as usize;
            let next = page.last().map(|job| (job.created_at, job.id.clone()));

            match next {
                Some(cursor) => Ok(Some((page, (Some(cursor), exhausted, fetch)))),
                None => Ok(None),
            }
        },
    )
    .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}
