//! Job records as stored in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{JobPayload, JobState, WorkerId};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the textual format of an externally supplied ID.
    ///
    /// Valid format: alphanumeric characters and hyphens only, 8-64 chars.
    pub fn is_valid(id: &str) -> bool {
        if id.len() < 8 || id.len() > 64 {
            return false;
        }
        id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Classification of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker capability reported a failure
    TaskFailure,
    /// The job exceeded the per-job timeout
    Timeout,
    /// A running job was cancelled on request
    Cancelled,
    /// The task died without reporting (panic, kill, OOM)
    Crashed,
    /// Requeued too many times after worker failures
    AttemptsExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TaskFailure => "task_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Crashed => "crashed",
            FailureKind::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    /// Reference to the produced artifact
    Artifact(String),
    /// Error detail, recorded verbatim
    Error { kind: FailureKind, detail: String },
}

impl JobResult {
    pub fn artifact(reference: impl Into<String>) -> Self {
        Self::Artifact(reference.into())
    }

    pub fn error(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Error {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Artifact(_))
    }

    /// Failure kind, if this is an error result.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            JobResult::Artifact(_) => None,
            JobResult::Error { kind, .. } => Some(*kind),
        }
    }
}

/// A GPU-bound job as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// What to run
    pub payload: JobPayload,

    /// Current lifecycle state
    #[serde(default)]
    pub state: JobState,

    /// GPU units required while admitted or running
    pub gpu_cost: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Set when the job starts running, cleared on requeue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set when the job reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Artifact reference or error detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    /// Requeues caused by worker failure
    #[serde(default)]
    pub attempt_count: u32,

    /// Worker holding the reservation (internal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Last transition timestamp (internal)
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new Pending job.
    pub fn new(payload: JobPayload, gpu_cost: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Pending,
            gpu_cost,
            created_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            attempt_count: 0,
            worker_id: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Public view without internal ledger metadata.
    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Job record returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    pub gpu_cost: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub attempt_count: u32,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            payload: job.payload.clone(),
            state: job.state,
            gpu_cost: job.gpu_cost,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            result: job.result.clone(),
            attempt_count: job.attempt_count,
        }
    }
}

/// One committed state change in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}
