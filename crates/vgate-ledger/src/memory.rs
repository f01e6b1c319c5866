//! In-process ledger backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use vgate_models::{Job, JobId, JobPayload, JobState, TransitionRecord};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{keyset_stream, JobLedger, JobStream};
use crate::metrics::record_conflict;
use crate::transition::Transition;

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    history: HashMap<JobId, Vec<TransitionRecord>>,
}

/// Ledger kept in process memory.
///
/// Same compare-and-swap semantics as the postgres backend; contents are
/// lost when the process exits.
#[derive(Clone)]
pub struct MemoryLedger {
    tables: Arc<RwLock<Tables>>,
    page_size: u32,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            page_size,
        }
    }

    /// Number of recorded jobs.
    pub async fn len(&self) -> usize {
        self.tables.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create(&self, payload: JobPayload, gpu_cost: u32) -> LedgerResult<Job> {
        let job = Job::new(payload, gpu_cost);
        let mut tables = self.tables.write().await;
        tables.jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, gpu_cost, "Job recorded");
        Ok(job)
    }

    async fn transition(&self, id: &JobId, transition: Transition) -> LedgerResult<Job> {
        transition.check()?;

        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;

        if job.state != transition.from {
            record_conflict();
            return Err(LedgerError::Conflict {
                id: id.clone(),
                expected: transition.from,
                actual: job.state,
            });
        }

        let now = Utc::now();
        let record = transition.record(job, now);
        transition.apply(job, now);
        let updated = job.clone();

        tables.history.entry(id.clone()).or_default().push(record);
        Ok(updated)
    }

    async fn get(&self, id: &JobId) -> LedgerResult<Job> {
        self.tables
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    fn list_by_state(&self, state: JobState) -> JobStream {
        let tables = Arc::clone(&self.tables);

        keyset_stream(self.page_size, move |after, limit| {
            let tables = Arc::clone(&tables);
            async move {
                let tables = tables.read().await;
                let mut page: Vec<Job> = tables
                    .jobs
                    .values()
                    .filter(|job| job.state == state)
                    .filter(|job| match &after {
                        Some((created_at, id)) => (job.created_at, &job.id) > (*created_at, id),
                        None => true,
                    })
                    .cloned()
                    .collect();
                page.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
                page.truncate(limit as usize);
                Ok::<_, LedgerError>(page)
            }
        })
    }

    async fn history(&self, id: &JobId) -> LedgerResult<Vec<TransitionRecord>> {
        let tables = self.tables.read().await;
        if !tables.jobs.contains_key(id) {
            return Err(LedgerError::NotFound(id.clone()));
        }
        Ok(tables.history.get(id).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> LedgerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use vgate_models::{FailureKind, JobResult, Operation, WorkerId};

    fn payload() -> JobPayload {
        JobPayload::new(Operation::Transcode, "/media/in.mp4")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = MemoryLedger::new();
        let job = ledger.create(payload(), 3).await.unwrap();

        let fetched = tokio_test::assert_ok!(ledger.get(&job.id).await);
        assert_eq!(fetched.state, JobState::Pending);
        assert_eq!(fetched.gpu_cost, 3);
        let missing = tokio_test::assert_err!(ledger.get(&JobId::new()).await);
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_transition_twice_conflicts() {
        let ledger = MemoryLedger::new();
        let job = ledger.create(payload(), 1).await.unwrap();
        let admit = Transition::admit(WorkerId::from("gpu-0"));

        ledger.transition(&job.id, admit.clone()).await.unwrap();
        let err = ledger.transition(&job.id, admit).await.unwrap_err();

        match err {
            LedgerError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, JobState::Pending);
                assert_eq!(actual, JobState::Admitted);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Rejected call left the record and history untouched
        let stored = ledger.get(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Admitted);
        assert_eq!(ledger.history(&job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_edge_rejected_before_storage() {
        let ledger = MemoryLedger::new();
        let job = ledger.create(payload(), 1).await.unwrap();

        let err = ledger
            .transition(&job.id, Transition::new(JobState::Pending, JobState::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert!(ledger.history(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_in_commit_order() {
        let ledger = MemoryLedger::new();
        let job = ledger.create(payload(), 1).await.unwrap();
        let worker = WorkerId::from("gpu-0");

        ledger.transition(&job.id, Transition::admit(worker.clone())).await.unwrap();
        ledger.transition(&job.id, Transition::start()).await.unwrap();
        let done = ledger
            .transition(
                &job.id,
                Transition::finish(JobResult::error(FailureKind::TaskFailure, "exit 1")),
            )
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Failed);

        let history = ledger.history(&job.id).await.unwrap();
        let edges: Vec<_> = history.iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            edges,
            vec![
                (JobState::Pending, JobState::Admitted),
                (JobState::Admitted, JobState::Running),
                (JobState::Running, JobState::Failed),
            ]
        );
        assert!(history.iter().all(|r| r.worker_id.as_ref() == Some(&worker)));
    }

    #[tokio::test]
    async fn test_list_by_state_pages_through_everything() {
        let ledger = MemoryLedger::with_page_size(2);
        let mut pending = Vec::new();
        for _ in 0..5 {
            pending.push(ledger.create(payload(), 1).await.unwrap().id);
        }
        ledger
            .transition(&pending[1], Transition::admit(WorkerId::from("gpu-0")))
            .await
            .unwrap();

        let listed: Vec<Job> = ledger
            .list_by_state(JobState::Pending)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed.iter().all(|job| job.state == JobState::Pending));
        assert!(listed.windows(2).all(|w| (w[0].created_at, &w[0].id) < (w[1].created_at, &w[1].id)));

        // Restartable: a second pass sees the same jobs
        let again: Vec<Job> = ledger
            .list_by_state(JobState::Pending)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(again.len(), 4);
    }

    #[tokio::test]
    async fn test_list_empty_state() {
        let ledger = MemoryLedger::new();
        ledger.create(payload(), 1).await.unwrap();

        let running: Vec<Job> = ledger
            .list_by_state(JobState::Running)
            .try_collect()
            .await
            .unwrap();
        assert!(running.is_empty());
    }
}
