//! Redis reservation store.
//!
//! Layout (all keys under the configured prefix):
//! - `{p}:slots` set of worker ids
//! - `{p}:slot:{worker}` hash with `capacity`, `reserved`, `health`
//! - `{p}:claims` hash of job id -> claim JSON
//! - `{p}:pending` sorted set of job ids scored by `{p}:pending:seq`
//! - `{p}:lock:{name}` lock token, set with `NX PX`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;
use vgate_models::{Claim, HealthStatus, JobId, WorkerId, WorkerSlot};

use super::{CapacityOutcome, ReservationStore, ReserveOutcome};
use crate::error::{QueueError, QueueResult};

/// KEYS: slot, slots. ARGV: capacity, worker id, initial health.
/// Returns -1 when set, otherwise the reservation that blocked it.
const CAPACITY_SCRIPT: &str = r#"
local reserved = tonumber(redis.call('HGET', KEYS[1], 'reserved') or '0')
if reserved > tonumber(ARGV[1]) then
    return reserved
end
redis.call('HSET', KEYS[1], 'capacity', ARGV[1])
redis.call('HSETNX', KEYS[1], 'reserved', 0)
redis.call('HSETNX', KEYS[1], 'health', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[2])
return -1
"#;

/// KEYS: slot, claims. ARGV: job id, cost, claim JSON.
const RESERVE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
    return -2
end
local capacity = redis.call('HGET', KEYS[1], 'capacity')
if not capacity then
    return -1
end
local reserved = tonumber(redis.call('HGET', KEYS[1], 'reserved') or '0')
local cost = tonumber(ARGV[2])
if reserved + cost > tonumber(capacity) then
    return 0
end
redis.call('HINCRBY', KEYS[1], 'reserved', cost)
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

/// KEYS: claims, slot. ARGV: job id, expected claim JSON, cost.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
local reserved = tonumber(redis.call('HGET', KEYS[2], 'reserved') or '0') - tonumber(ARGV[3])
if reserved < 0 then
    reserved = 0
end
redis.call('HSET', KEYS[2], 'reserved', reserved)
return 1
"#;

/// KEYS: lock. ARGV: token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Reservation store in Redis (or Valkey).
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    capacity: redis::Script,
    reserve: redis::Script,
    release: redis::Script,
    unlock: redis::Script,
}

impl RedisStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            capacity: redis::Script::new(CAPACITY_SCRIPT),
            reserve: redis::Script::new(RESERVE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
            unlock: redis::Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn slots_key(&self) -> String {
        format!("{}:slots", self.prefix)
    }

    fn slot_key(&self, worker: &WorkerId) -> String {
        format!("{}:slot:{}", self.prefix, worker)
    }

    fn claims_key(&self) -> String {
        format!("{}:claims", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn pending_seq_key(&self) -> String {
        format!("{}:pending:seq", self.prefix)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    fn parse_slot(worker: &WorkerId, fields: HashMap<String, String>) -> QueueResult<Option<WorkerSlot>> {
        let Some(capacity) = fields.get("capacity") else {
            return Ok(None);
        };
        let parse = |name: &str, value: &str| {
            value
                .parse::<u32>()
                .map_err(|_| QueueError::store(format!("slot {} has invalid {}: {}", worker, name, value)))
        };

        let health = match fields.get("health") {
            Some(value) => value.parse().map_err(QueueError::store)?,
            None => HealthStatus::Healthy,
        };

        Ok(Some(WorkerSlot {
            worker_id: worker.clone(),
            total_gpu_capacity: parse("capacity", capacity)?,
            reserved_gpu: match fields.get("reserved") {
                Some(value) => parse("reserved", value)?,
                None => 0,
            },
            health_status: health,
        }))
    }
}

#[async_trait]
impl ReservationStore for RedisStore {
    async fn set_capacity(&self, worker: &WorkerId, capacity: u32) -> QueueResult<CapacityOutcome> {
        let mut conn = self.conn().await?;

        let code: i64 = self
            .capacity
            .key(self.slot_key(worker))
            .key(self.slots_key())
            .arg(capacity)
            .arg(worker.as_str())
            .arg(HealthStatus::Healthy.as_str())
            .invoke_async(&mut conn)
            .await?;

        if code < 0 {
            debug!(worker_id = %worker, capacity, "Registered worker slot");
            return Ok(CapacityOutcome::Set);
        }
        let reserved = u32::try_from(code)
            .map_err(|_| QueueError::store(format!("slot {} has invalid reserved: {}", worker, code)))?;
        Ok(CapacityOutcome::BelowReserved { reserved })
    }

    async fn set_health(&self, worker: &WorkerId, status: HealthStatus) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let slot_key = self.slot_key(worker);

        let exists: bool = conn.hexists(&slot_key, "capacity").await?;
        if !exists {
            return Ok(false);
        }
        conn.hset::<_, _, _, ()>(&slot_key, "health", status.as_str())
            .await?;
        Ok(true)
    }

    async fn slot(&self, worker: &WorkerId) -> QueueResult<Option<WorkerSlot>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.slot_key(worker)).await?;
        Self::parse_slot(worker, fields)
    }

    async fn slots(&self) -> QueueResult<Vec<WorkerSlot>> {
        let mut conn = self.conn().await?;
        let mut workers: Vec<String> = conn.smembers(self.slots_key()).await?;
        workers.sort();

        let mut slots = Vec::with_capacity(workers.len());
        for worker in workers {
            let worker = WorkerId::from(worker);
            let fields: HashMap<String, String> = conn.hgetall(self.slot_key(&worker)).await?;
            if let Some(slot) = Self::parse_slot(&worker, fields)? {
                slots.push(slot);
            }
        }
        Ok(slots)
    }

    async fn try_reserve(&self, claim: &Claim) -> QueueResult<ReserveOutcome> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(claim)?;

        let code: i64 = self
            .reserve
            .key(self.slot_key(&claim.worker_id))
            .key(self.claims_key())
            .arg(claim.job_id.as_str())
            .arg(claim.gpu_cost)
            .arg(encoded)
            .invoke_async(&mut conn)
            .await?;

        Ok(match code {
            1 => ReserveOutcome::Reserved,
            0 => ReserveOutcome::Insufficient,
            -1 => ReserveOutcome::UnknownWorker,
            -2 => ReserveOutcome::AlreadyClaimed,
            other => {
                return Err(QueueError::store(format!(
                    "unexpected reserve script result: {}",
                    other
                )))
            }
        })
    }

    async fn release(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.claims_key(), job_id.as_str()).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let claim: Claim = serde_json::from_str(&raw)?;

        let released: i64 = self
            .release
            .key(self.claims_key())
            .key(self.slot_key(&claim.worker_id))
            .arg(job_id.as_str())
            .arg(&raw)
            .arg(claim.gpu_cost)
            .invoke_async(&mut conn)
            .await?;

        if released == 1 {
            Ok(Some(claim))
        } else {
            // Released concurrently by someone else
            Ok(None)
        }
    }

    async fn claim(&self, job_id: &JobId) -> QueueResult<Option<Claim>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.claims_key(), job_id.as_str()).await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn claims_for(&self, worker: &WorkerId) -> QueueResult<Vec<Claim>> {
        let mut conn = self.conn().await?;
        let all: HashMap<String, String> = conn.hgetall(self.claims_key()).await?;

        let mut claims = Vec::new();
        for (job_id, raw) in all {
            match serde_json::from_str::<Claim>(&raw) {
                Ok(claim) if &claim.worker_id == worker => claims.push(claim),
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Skipping malformed claim"),
            }
        }
        claims.sort_by_key(|claim| claim.reserved_at);
        Ok(claims)
    }

    async fn push_pending(&self, job_id: &JobId) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let pending_key = self.pending_key();

        let existing: Option<u64> = conn.zrank(&pending_key, job_id.as_str()).await?;
        if let Some(rank) = existing {
            return Ok(rank + 1);
        }

        let seq: u64 = conn.incr(self.pending_seq_key(), 1).await?;
        redis::cmd("ZADD")
            .arg(&pending_key)
            .arg("NX")
            .arg(seq)
            .arg(job_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;

        let rank: Option<u64> = conn.zrank(&pending_key, job_id.as_str()).await?;
        rank.map(|r| r + 1)
            .ok_or_else(|| QueueError::store(format!("job {} vanished from pending queue", job_id)))
    }

    async fn pending(&self, limit: usize) -> QueueResult<Vec<JobId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrange(self.pending_key(), 0, limit as isize - 1)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn remove_pending(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(self.pending_key(), job_id.as_str()).await?;
        Ok(removed > 0)
    }

    async fn pending_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(self.pending_key()).await?)
    }

    async fn try_lock(&self, name: &str, ttl: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.conn().await?;
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| token))
    }

    async fn unlock(&self, name: &str, token: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .unlock
            .key(self.lock_key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let store = RedisStore::new("redis://localhost:6379", "vgate-test").unwrap();
        assert_eq!(store.slot_key(&WorkerId::from("gpu-0")), "vgate-test:slot:gpu-0");
        assert_eq!(store.claims_key(), "vgate-test:claims");
        assert_eq!(store.lock_key("admission"), "vgate-test:lock:admission");
    }

    #[test]
    fn test_parse_slot() {
        let worker = WorkerId::from("gpu-0");
        let fields = HashMap::from([
            ("capacity".to_string(), "4".to_string()),
            ("reserved".to_string(), "3".to_string()),
            ("health".to_string(), "unresponsive".to_string()),
        ]);
        let slot = RedisStore::parse_slot(&worker, fields).unwrap().unwrap();
        assert_eq!(slot.remaining(), 1);
        assert_eq!(slot.health_status, HealthStatus::Unresponsive);

        assert!(RedisStore::parse_slot(&worker, HashMap::new()).unwrap().is_none());
    }
}
