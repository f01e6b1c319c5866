//! Postgres ledger tests.
//!
//! Run with a live database:
//! `DATABASE_URL=postgres://localhost/vgate_test cargo test -p vgate-ledger -- --ignored`

use futures_util::TryStreamExt;
use vgate_ledger::{JobLedger, LedgerConfig, LedgerError, PgLedger, Transition};
use vgate_models::{FailureKind, Job, JobPayload, JobResult, JobState, Operation, WorkerId};

async fn ledger() -> PgLedger {
    let config = LedgerConfig {
        database_url: std::env::var("DATABASE_URL").ok(),
        page_size: 2,
        ..Default::default()
    };
    let ledger = PgLedger::connect(&config).await.expect("connect");
    ledger.init().await.expect("init schema");
    ledger
}

fn payload() -> JobPayload {
    JobPayload::new(Operation::Segment, "s3://media/input.mp4").with_param("segment_seconds", "10")
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_full_lifecycle_persists() {
    let ledger = ledger().await;
    let job = ledger.create(payload(), 2).await.unwrap();
    let worker = WorkerId::from("gpu-test");

    ledger.transition(&job.id, Transition::admit(worker.clone())).await.unwrap();
    let running = ledger.transition(&job.id, Transition::start()).await.unwrap();
    assert!(running.started_at.is_some());
    assert_eq!(running.worker_id, Some(worker));

    let done = ledger
        .transition(&job.id, Transition::finish(JobResult::artifact("s3://media/out/")))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert!(done.finished_at.is_some());

    let stored = ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.payload, payload());
    assert_eq!(ledger.history(&job.id).await.unwrap().len(), 3);
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_cas_conflict_leaves_record_unchanged() {
    let ledger = ledger().await;
    let job = ledger.create(payload(), 1).await.unwrap();

    ledger
        .transition(&job.id, Transition::new(JobState::Pending, JobState::Cancelled))
        .await
        .unwrap();
    let err = ledger
        .transition(&job.id, Transition::admit(WorkerId::from("gpu-test")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Conflict {
            actual: JobState::Cancelled,
            ..
        }
    ));

    let stored = ledger.get(&job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Cancelled);
    assert!(stored.worker_id.is_none());
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_requeue_increments_attempts() {
    let ledger = ledger().await;
    let job = ledger.create(payload(), 1).await.unwrap();

    ledger
        .transition(&job.id, Transition::admit(WorkerId::from("gpu-test")))
        .await
        .unwrap();
    ledger.transition(&job.id, Transition::start()).await.unwrap();
    let requeued = ledger.transition(&job.id, Transition::requeue_running()).await.unwrap();

    assert_eq!(requeued.state, JobState::Pending);
    assert_eq!(requeued.attempt_count, 1);
    assert!(requeued.worker_id.is_none());
    assert!(requeued.started_at.is_none());

    let failed = ledger
        .transition(
            &job.id,
            Transition::new(JobState::Pending, JobState::Failed)
                .with_result(JobResult::error(FailureKind::AttemptsExhausted, "3 attempts")),
        )
        .await
        .unwrap();
    assert_eq!(failed.state, JobState::Failed);
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_list_by_state_includes_new_jobs() {
    let ledger = ledger().await;
    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(ledger.create(payload(), 1).await.unwrap().id);
    }

    let pending: Vec<Job> = ledger
        .list_by_state(JobState::Pending)
        .try_collect()
        .await
        .unwrap();
    for id in &created {
        assert!(pending.iter().any(|job| &job.id == id));
    }
}
