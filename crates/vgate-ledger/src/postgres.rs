//! PostgreSQL ledger backend.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use vgate_models::{Job, JobId, JobPayload, JobResult, JobState, TransitionRecord, WorkerId};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{keyset_stream, Cursor, JobLedger, JobStream};
use crate::metrics::{record_conflict, record_operation};
use crate::transition::Transition;

// =============================================================================
// Schema
// =============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vgate_jobs (
        id            TEXT PRIMARY KEY,
        payload       JSONB NOT NULL,
        state         TEXT NOT NULL,
        gpu_cost      INTEGER NOT NULL CHECK (gpu_cost > 0),
        created_at    TIMESTAMPTZ NOT NULL,
        started_at    TIMESTAMPTZ,
        finished_at   TIMESTAMPTZ,
        result        JSONB,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        worker_id     TEXT,
        updated_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS vgate_jobs_state_created_idx
        ON vgate_jobs (state, created_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vgate_job_transitions (
        seq        BIGSERIAL PRIMARY KEY,
        job_id     TEXT NOT NULL REFERENCES vgate_jobs (id),
        from_state TEXT NOT NULL,
        to_state   TEXT NOT NULL,
        at         TIMESTAMPTZ NOT NULL,
        worker_id  TEXT,
        result     JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS vgate_job_transitions_job_idx
        ON vgate_job_transitions (job_id, seq)
    "#,
];

const JOB_COLUMNS: &str = "id, payload, state, gpu_cost, created_at, started_at, finished_at, \
                           result, attempt_count, worker_id, updated_at";

// =============================================================================
// Ledger
// =============================================================================

/// Ledger stored in PostgreSQL.
///
/// Transitions run `UPDATE ... WHERE id = $1 AND state = $2` and the history
/// insert in one transaction.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    page_size: u32,
}

impl PgLedger {
    /// Connect a pool using `config.database_url`.
    pub async fn connect(config: &LedgerConfig) -> LedgerResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| LedgerError::config("DATABASE_URL not set"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to postgres ledger");
        Ok(Self::from_pool(pool, config.page_size))
    }

    pub fn from_pool(pool: PgPool, page_size: u32) -> Self {
        Self { pool, page_size }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Ledger schema ready");
        Ok(())
    }

    async fn current_state(&self, id: &JobId) -> LedgerResult<JobState> {
        let row = sqlx::query("SELECT state FROM vgate_jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => parse_state(row.try_get("state")?),
            None => Err(LedgerError::NotFound(id.clone())),
        }
    }

    async fn cas(&self, id: &JobId, transition: &Transition) -> LedgerResult<Option<Job>> {
        let now = Utc::now();
        let result = transition.result.as_ref().map(serde_json::to_value).transpose()?;
        let worker = transition.worker.as_ref().map(|w| w.as_str().to_string());

        let mut tx = self.pool.begin().await?;

        let update = format!(
            r#"
            UPDATE vgate_jobs SET
                state = $3,
                updated_at = $4,
                started_at = CASE WHEN $3 = 'running' THEN $4
                                  WHEN $3 = 'pending' THEN NULL
                                  ELSE started_at END,
                finished_at = CASE WHEN $5 THEN $4 ELSE finished_at END,
                result = COALESCE($6, result),
                worker_id = CASE WHEN $3 = 'admitted' THEN $7
                                 WHEN $3 = 'pending' THEN NULL
                                 ELSE worker_id END,
                attempt_count = attempt_count + $8
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&update)
            .bind(id.as_str())
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(now)
            .bind(transition.to.is_terminal())
            .bind(&result)
            .bind(&worker)
            .bind(if transition.increments_attempt() { 1i32 } else { 0i32 })
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let job = job_from_row(&row)?;

        let record = transition.record(&job, now);
        sqlx::query(
            r#"
            INSERT INTO vgate_job_transitions (job_id, from_state, to_state, at, worker_id, result)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id.as_str())
        .bind(record.from.as_str())
        .bind(record.to.as_str())
        .bind(record.at)
        .bind(record.worker_id.as_ref().map(|w| w.as_str().to_string()))
        .bind(&result)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobLedger for PgLedger {
    async fn create(&self, payload: JobPayload, gpu_cost: u32) -> LedgerResult<Job> {
        let start = Instant::now();
        let job = Job::new(payload, gpu_cost);

        let outcome = sqlx::query(
            r#"
            INSERT INTO vgate_jobs (id, payload, state, gpu_cost, created_at, attempt_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            "#,
        )
        .bind(job.id.as_str())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.state.as_str())
        .bind(cost_to_db(gpu_cost)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        record_operation("create", outcome.is_ok(), start.elapsed().as_secs_f64());
        outcome?;

        debug!(job_id = %job.id, gpu_cost, "Job recorded");
        Ok(job)
    }

    async fn transition(&self, id: &JobId, transition: Transition) -> LedgerResult<Job> {
        transition.check()?;
        let start = Instant::now();

        let outcome = self.cas(id, &transition).await;
        record_operation("transition", outcome.is_ok(), start.elapsed().as_secs_f64());

        match outcome? {
            Some(job) => Ok(job),
            None => {
                let actual = self.current_state(id).await?;
                record_conflict();
                warn!(
                    job_id = %id,
                    expected = %transition.from,
                    actual = %actual,
                    "Transition lost compare-and-swap"
                );
                Err(LedgerError::Conflict {
                    id: id.clone(),
                    expected: transition.from,
                    actual,
                })
            }
        }
    }

    async fn get(&self, id: &JobId) -> LedgerResult<Job> {
        let query = format!("SELECT {} FROM vgate_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(LedgerError::NotFound(id.clone())),
        }
    }

    fn list_by_state(&self, state: JobState) -> JobStream {
        let pool = self.pool.clone();

        keyset_stream(self.page_size, move |after, limit| {
            fetch_page(pool.clone(), state, after, limit)
        })
    }

    async fn history(&self, id: &JobId) -> LedgerResult<Vec<TransitionRecord>> {
        // Distinguish "no transitions yet" from "no such job"
        self.current_state(id).await?;

        let rows = sqlx::query(
            r#"
            SELECT job_id, from_state, to_state, at, worker_id, result
            FROM vgate_job_transitions
            WHERE job_id = $1
            ORDER BY seq
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn ping(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn fetch_page(
    pool: PgPool,
    state: JobState,
    after: Option<Cursor>,
    limit: u32,
) -> LedgerResult<Vec<Job>> {
    let (after_created, after_id) = match after {
        Some((created_at, id)) => (Some(created_at), Some(id.0)),
        None => (None, None),
    };
    let query = format!(
        r#"
        SELECT {} FROM vgate_jobs
        WHERE state = $1
          AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
        ORDER BY created_at, id
        LIMIT $4
        "#,
        JOB_COLUMNS
    );
    let rows = sqlx::query(&query)
        .bind(state.as_str())
        .bind(after_created)
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_state(value: String) -> LedgerResult<JobState> {
    value
        .parse()
        .map_err(|e| LedgerError::corrupt(format!("{}", e)))
}

fn cost_to_db(gpu_cost: u32) -> LedgerResult<i32> {
    i32::try_from(gpu_cost).map_err(|_| LedgerError::corrupt(format!("gpu_cost {} out of range", gpu_cost)))
}

fn non_negative(value: i32, column: &str) -> LedgerResult<u32> {
    u32::try_from(value).map_err(|_| LedgerError::corrupt(format!("negative {}: {}", column, value)))
}

fn job_from_row(row: &PgRow) -> LedgerResult<Job> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let worker_id: Option<String> = row.try_get("worker_id")?;

    Ok(Job {
        id: JobId::from_string(row.try_get::<String, _>("id")?),
        payload: serde_json::from_value(payload)?,
        state: parse_state(row.try_get("state")?)?,
        gpu_cost: non_negative(row.try_get("gpu_cost")?, "gpu_cost")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        result: result.map(serde_json::from_value::<JobResult>).transpose()?,
        attempt_count: non_negative(row.try_get("attempt_count")?, "attempt_count")?,
        worker_id: worker_id.map(WorkerId::from),
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> LedgerResult<TransitionRecord> {
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let worker_id: Option<String> = row.try_get("worker_id")?;

    Ok(TransitionRecord {
        job_id: JobId::from_string(row.try_get::<String, _>("job_id")?),
        from: parse_state(row.try_get("from_state")?)?,
        to: parse_state(row.try_get("to_state")?)?,
        at: row.try_get("at")?,
        worker_id: worker_id.map(WorkerId::from),
        result: result.map(serde_json::from_value::<JobResult>).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_conversion_bounds() {
        assert_eq!(cost_to_db(4).unwrap(), 4);
        assert!(cost_to_db(u32::MAX).is_err());
        assert!(non_negative(-1, "attempt_count").is_err());
    }

    #[test]
    fn test_parse_state_reports_corruption() {
        assert_eq!(parse_state("running".to_string()).unwrap(), JobState::Running);
        assert!(matches!(
            parse_state("bogus".to_string()),
            Err(LedgerError::Corrupt(_))
        ));
    }
}
