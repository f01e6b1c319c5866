//! API and orchestrator configuration.

use std::str::FromStr;
use std::time::Duration;

use url::Url;
use vgate_ledger::LedgerConfig;
use vgate_models::WorkerId;
use vgate_queue::QueueConfig;
use vgate_worker::WorkerConfig;

use crate::error::{ApiError, ApiResult};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Max request body size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    /// Serve Prometheus metrics at /metrics
    pub metrics_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            max_body_size: 1024 * 1024, // 1MB
            environment: "development".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> ApiResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from `lookup`; set but malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ApiResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("API_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "API_PORT")?.unwrap_or(defaults.port),
            cors_origins: lookup("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            max_body_size: parse_var(&lookup, "MAX_BODY_SIZE")?.unwrap_or(defaults.max_body_size),
            environment: lookup("ENVIRONMENT").unwrap_or(defaults.environment),
            metrics_enabled: parse_flag(&lookup, "METRICS_ENABLED")?
                .unwrap_or(defaults.metrics_enabled),
        })
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

// ============================================================================
// Health monitor
// ============================================================================

/// Autoheal loop configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Time between probe rounds
    pub probe_interval: Duration,
    /// Consecutive unhealthy probes before a forced restart
    pub unhealthy_threshold: u32,
    /// Per-request timeout of HTTP probes
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: Duration::from_secs(10),
            unhealthy_threshold: 3,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl HealthConfig {
    pub fn from_env() -> ApiResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ApiResult<Self> {
        let defaults = Self::default();
        let secs = |name: &str| -> ApiResult<Option<Duration>> {
            Ok(parse_var::<u64>(&lookup, name)?.map(Duration::from_secs))
        };

        let config = Self {
            enabled: parse_flag(&lookup, "HEALTH_MONITOR_ENABLED")?.unwrap_or(defaults.enabled),
            probe_interval: secs("HEALTH_PROBE_INTERVAL_SECS")?.unwrap_or(defaults.probe_interval),
            unhealthy_threshold: parse_var(&lookup, "HEALTH_UNHEALTHY_THRESHOLD")?
                .unwrap_or(defaults.unhealthy_threshold),
            probe_timeout: secs("HEALTH_PROBE_TIMEOUT_SECS")?.unwrap_or(defaults.probe_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.probe_interval.is_zero() {
            return Err(ApiError::config("HEALTH_PROBE_INTERVAL_SECS must be positive"));
        }
        if self.unhealthy_threshold == 0 {
            return Err(ApiError::config("HEALTH_UNHEALTHY_THRESHOLD must be positive"));
        }
        if self.probe_timeout.is_zero() {
            return Err(ApiError::config("HEALTH_PROBE_TIMEOUT_SECS must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Workers
// ============================================================================

/// One configured GPU worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub gpu_capacity: u32,
    /// Liveness URL of an externally managed worker container
    pub probe_url: Option<Url>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, gpu_capacity: u32) -> Self {
        Self {
            id: WorkerId::new(id),
            gpu_capacity,
            probe_url: None,
        }
    }

    pub fn with_probe_url(mut self, url: Url) -> Self {
        self.probe_url = Some(url);
        self
    }
}

/// Parse `id:capacity[:probe_url]` entries separated by commas.
pub fn parse_workers(value: &str) -> ApiResult<Vec<WorkerSpec>> {
    let mut workers: Vec<WorkerSpec> = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let id = parts.next().unwrap_or_default().trim();
        let capacity = parts.next().map(str::trim);

        if id.is_empty() {
            return Err(ApiError::config(format!("worker entry '{}' has no id", entry)));
        }
        let gpu_capacity = capacity
            .and_then(|c| c.parse::<u32>().ok())
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                ApiError::config(format!(
                    "worker '{}' needs a positive GPU capacity (id:capacity[:probe_url])",
                    id
                ))
            })?;

        let mut spec = WorkerSpec::new(id, gpu_capacity);
        if let Some(raw) = parts.next().map(str::trim).filter(|s| !s.is_empty()) {
            let url = Url::parse(raw).map_err(|e| {
                ApiError::config(format!("worker '{}' has an invalid probe URL: {}", id, e))
            })?;
            spec = spec.with_probe_url(url);
        }

        if workers.iter().any(|w| w.id == spec.id) {
            return Err(ApiError::config(format!("worker '{}' is configured twice", id)));
        }
        workers.push(spec);
    }

    if workers.is_empty() {
        return Err(ApiError::config("at least one worker must be configured"));
    }
    Ok(workers)
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Everything the orchestrator process needs besides the HTTP surface.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub ledger: LedgerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub workers: Vec<WorkerSpec>,
}

impl OrchestratorConfig {
    /// In-process backends with a single worker, for tests and local runs.
    pub fn memory(workers: Vec<WorkerSpec>) -> Self {
        Self {
            ledger: LedgerConfig::memory(),
            queue: QueueConfig::memory(),
            worker: WorkerConfig::default(),
            health: HealthConfig::default(),
            workers,
        }
    }

    /// Load from the environment.
    ///
    /// Workers come from `WORKERS` (`id:capacity[:probe_url],...`), or from
    /// `WORKER_ID` and `WORKER_GPU_CAPACITY` for a single worker. A capacity
    /// is always required.
    pub fn from_env() -> ApiResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ApiResult<Self> {
        let workers = match lookup("WORKERS") {
            Some(value) => parse_workers(&value)?,
            None => {
                let id = lookup("WORKER_ID").unwrap_or_else(|| "gpu-0".to_string());
                let capacity = lookup("WORKER_GPU_CAPACITY").ok_or_else(|| {
                    ApiError::config("set WORKERS or WORKER_GPU_CAPACITY to describe the GPU workers")
                })?;
                let mut entry = format!("{}:{}", id, capacity);
                if let Some(url) = lookup("WORKER_PROBE_URL") {
                    entry = format!("{}:{}", entry, url);
                }
                parse_workers(&entry)?
            }
        };

        let config = Self {
            ledger: LedgerConfig::from_lookup(&lookup)?,
            queue: QueueConfig::from_lookup(&lookup)?,
            worker: WorkerConfig::from_lookup(&lookup)?,
            health: HealthConfig::from_lookup(&lookup)?,
            workers,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ApiResult<()> {
        self.ledger.validate()?;
        self.queue.validate()?;
        self.worker.validate()?;
        self.health.validate()?;
        if self.workers.is_empty() {
            return Err(ApiError::config("at least one worker must be configured"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> ApiResult<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|_| {
                ApiError::config(format!("{} must be a non-negative integer, got '{}'", name, raw))
            })
        })
        .transpose()
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> ApiResult<Option<bool>> {
    lookup(name)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ApiError::config(format!("{} must be true or false, got '{}'", name, raw))),
        })
        .transpose()
}
