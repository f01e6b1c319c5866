//! Worker slots and GPU reservations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::JobId;

/// Identifier of a worker (one GPU resource pool).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Health of a worker as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Running but lagging; still admits work
    Degraded,
    /// Not admitting work until it recovers
    Unresponsive,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unresponsive => "unresponsive",
        }
    }

    /// Only healthy slots admit new jobs.
    pub fn admits_work(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "unresponsive" => Ok(HealthStatus::Unresponsive),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// Outcome of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// GPU capacity accounting for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    /// Fixed at provisioning
    pub total_gpu_capacity: u32,
    /// Sum of gpu_cost over the jobs currently holding a claim here
    pub reserved_gpu: u32,
    pub health_status: HealthStatus,
}

impl WorkerSlot {
    pub fn new(worker_id: WorkerId, total_gpu_capacity: u32) -> Self {
        Self {
            worker_id,
            total_gpu_capacity,
            reserved_gpu: 0,
            health_status: HealthStatus::Healthy,
        }
    }

    /// Capacity not yet reserved.
    pub fn remaining(&self) -> u32 {
        self.total_gpu_capacity.saturating_sub(self.reserved_gpu)
    }

    pub fn fits(&self, gpu_cost: u32) -> bool {
        gpu_cost <= self.remaining()
    }
}

/// One job's reservation on one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub gpu_cost: u32,
    #[serde(default = "Utc::now")]
    pub reserved_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(job_id: JobId, worker_id: WorkerId, gpu_cost: u32) -> Self {
        Self {
            job_id,
            worker_id,
            gpu_cost,
            reserved_at: Utc::now(),
        }
    }
}
