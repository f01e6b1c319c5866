//! In-process reservation store.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;
use vgate_models::{Claim, HealthStatus, JobId, WorkerId, WorkerSlot};

use super::{CapacityOutcome, ReservationStore, ReserveOutcome};
use crate::error::QueueResult;

#[derive(Default)]
struct State {
    slots: BTreeMap<WorkerId, WorkerSlot>,
    claims: HashMap<JobId, Claim>,
    /// seq -> job id; iteration order is FIFO order
    pending: BTreeMap<u64, JobId>,
    pending_seq: HashMap<JobId, u64>,
    next_seq: u64,
    locks: HashMap<String, (String, Instant)>,
}

/// Reservation store guarded by a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn set_capacity(&self, worker: &WorkerId, capacity: u32) -> QueueResult<CapacityOutcome> {
        let mut state = self.state.lock().await;
        match state.slots.get_mut(worker) {
            Some(slot) if slot.reserved_gpu > capacity => Ok(CapacityOutcome::BelowReserved {
                reserved: slot.reserved_gpu,
            }),
            Some(slot) => {
                slot.total_gpu_capacity = capacity;
                Ok(CapacityOutcome::Set)
            }
            None => {
                state
                    .slots
                    .insert(worker.clone(), WorkerSlot::new(worker.clone(), capacity));
                Ok(CapacityOutcome::Set)
            }
        }
    }

    async fn set_health(&self, worker: &WorkerId, status: HealthStatus) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.slots.get_mut(worker) {
            Some(slot) => {
                slot.health_status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn slot(&self, worker: &WorkerId) -> QueueResult<Option<WorkerSlot>> {
        Ok(self.state.lock().await.slots.get(worker).cloned())
    }

    async fn slots(&self) -> QueueResult<Vec<WorkerSlot>> {
        Ok(self.state.lock().await.slots.values().cloned().collect())
    }

    async fn try_reserve(&self, claim: &Claim) -> QueueResult<ReserveOutcome> {
        let mut state = self.state.lock().await;
        if state.claims.contains_key(&claim.job_id) {
            return Ok(ReserveOutcome::AlreadyClaimed);
        }

        let Some(slot) = state.slots.get_mut(&claim.worker_id) else {
            return Ok(ReserveOutcome::UnknownWorker);
        };
        if !slot.fits(claim.gpu_cost) {
            return Ok(ReserveOutcome::Insufficient);
        }
        slot.reserved_gpu += claim.gpu_cost;

        state.claims.insert(claim.job_id.clone(), claim.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn release(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        let mut state = self.state.lock().await;
        let Some(claim) = state.claims.remove(job_id) else {
            return Ok(None);
        };
        if let Some(slot) = state.slots.get_mut(&claim.worker_id) {
            slot.reserved_gpu = slot.reserved_gpu.saturating_sub(claim.gpu_cost);
        }
        Ok(Some(claim))
    }

    async fn claim(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        Ok(self.state.lock().await.claims.get(job_id).cloned())
    }

    async fn claims_for(&self, worker: &WorkerId) -> QueueResult<Vec<Claim>> {
        let state = self.state.lock().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|claim| &claim.worker_id == worker)
            .cloned()
            .collect();
        claims.sort_by_key(|claim| claim.reserved_at);
        Ok(claims)
    }

    async fn push_pending(&self, job_id: &JobId) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        if let Some(seq) = state.pending_seq.get(job_id).copied() {
            return Ok(state.pending.range(..=seq).count() as u64);
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.pending.insert(seq, job_id.clone());
        state.pending_seq.insert(job_id.clone(), seq);
        Ok(state.pending.len() as u64)
    }

    async fn pending(&self, limit: usize) -> QueueResult<Vec<JobId>> {
        let state = self.state.lock().await;
        Ok(state.pending.values().take(limit).cloned().collect())
    }

    async fn remove_pending(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.pending_seq.remove(job_id) {
            Some(seq) => {
                state.pending.remove(&seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_len(&self) -> QueueResult<u64> {
        Ok(self.state.lock().await.pending.len() as u64)
    }

    async fn try_lock(&self, name: &str, ttl: Duration) -> QueueResult<Option<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        state
            .locks
            .insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn unlock(&self, name: &str, token: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get(name) {
            Some((holder, _)) if holder == token => {
                state.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
