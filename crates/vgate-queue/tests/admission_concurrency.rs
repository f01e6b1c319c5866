//! Concurrent admission against the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use vgate_ledger::{JobLedger, MemoryLedger, Transition};
use vgate_models::{JobPayload, JobResult, JobState, Operation, WorkerId};
use vgate_queue::{AdmissionQueue, MemoryStore, QueueConfig, ReservationStore};

fn config() -> QueueConfig {
    QueueConfig {
        lock_wait: Duration::from_secs(10),
        lock_retry_interval: Duration::from_millis(1),
        ..QueueConfig::memory()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_never_overcommits() {
    let ledger = Arc::new(MemoryLedger::new());
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(AdmissionQueue::new(
        ledger.clone(),
        store.clone(),
        config(),
    ));

    let workers: Vec<WorkerId> = (0..3).map(|i| WorkerId::from(format!("gpu-{}", i))).collect();
    for worker in &workers {
        queue.register_worker(worker, 4).await.unwrap();
    }

    for i in 0..30u32 {
        let job = ledger
            .create(JobPayload::new(Operation::Transcode, "/media/in.mp4"), i % 3 + 1)
            .await
            .unwrap();
        queue.enqueue(&job).await.unwrap();
    }

    let mut tasks = Vec::new();
    for round in 0..12 {
        let queue = Arc::clone(&queue);
        let worker = workers[round % workers.len()].clone();
        tasks.push(tokio::spawn(async move {
            let mut admitted = Vec::new();
            for _ in 0..5 {
                if let Some(job) = queue.try_admit(&worker).await.unwrap() {
                    admitted.push(job);
                }
                let slot = queue.slot(&worker).await.unwrap();
                assert!(slot.reserved_gpu <= slot.total_gpu_capacity);
            }
            admitted
        }));
    }

    let mut admitted = Vec::new();
    for task in tasks {
        admitted.extend(task.await.unwrap());
    }

    // Every admitted job is admitted once and accounted on its worker
    let mut ids: Vec<_> = admitted.iter().map(|job| job.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), admitted.len());

    for worker in &workers {
        let slot = queue.slot(worker).await.unwrap();
        let claimed: u32 = store
            .claims_for(worker)
            .await
            .unwrap()
            .iter()
            .map(|claim| claim.gpu_cost)
            .sum();
        assert!(slot.reserved_gpu <= slot.total_gpu_capacity);
        assert_eq!(slot.reserved_gpu, claimed);
    }
}

#[tokio::test]
async fn test_waiting_job_admits_after_release() {
    let ledger = Arc::new(MemoryLedger::new());
    let queue = AdmissionQueue::new(ledger.clone(), Arc::new(MemoryStore::new()), config());
    let worker = WorkerId::from("gpu-0");
    queue.register_worker(&worker, 4).await.unwrap();

    let mut jobs = Vec::new();
    for cost in [2, 2, 3] {
        let job = ledger
            .create(JobPayload::new(Operation::Segment, "/media/in.mp4"), cost)
            .await
            .unwrap();
        queue.enqueue(&job).await.unwrap();
        jobs.push(job);
    }

    let first = queue.try_admit(&worker).await.unwrap().unwrap();
    queue.try_admit(&worker).await.unwrap().unwrap();
    assert!(queue.try_admit(&worker).await.unwrap().is_none());

    // First job runs to completion and releases
    ledger.transition(&first.id, Transition::start()).await.unwrap();
    ledger
        .transition(&first.id, Transition::finish(JobResult::artifact("done")))
        .await
        .unwrap();
    queue.release(&first.id).await.unwrap();

    // 2 free, job3 needs 3: still waiting
    assert!(queue.try_admit(&worker).await.unwrap().is_none());
    assert_eq!(ledger.get(&jobs[2].id).await.unwrap().state, JobState::Pending);
}
