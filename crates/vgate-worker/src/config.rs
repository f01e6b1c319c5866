//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration, shared by every supervisor in the process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between admission polls
    pub poll_interval: Duration,
    /// Heartbeat age after which the worker reports Degraded
    pub heartbeat_degraded_after: Duration,
    /// Heartbeat age after which the worker reports Unresponsive
    pub heartbeat_unresponsive_after: Duration,
    /// Consecutive task failures that mark the worker Degraded
    pub failure_threshold: u32,
    /// Per-job timeout
    pub job_timeout: Duration,
    /// How long a cancelled task may take to stop before it is aborted
    pub cancel_grace: Duration,
    /// How long to wait for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
    /// Work directory for job outputs
    pub work_dir: PathBuf,
    /// Program run by the command capability
    pub command: String,
    /// Arguments placed before the generated ones (wrappers such as `nice`)
    pub command_prefix_args: Vec<String>,
    /// A running command with no progress for this long is killed
    pub stall_timeout: Duration,
    /// Encode on the CPU (`NO_GPU`), for hosts without NVENC
    pub cpu_only: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_degraded_after: Duration::from_secs(5),
            heartbeat_unresponsive_after: Duration::from_secs(15),
            failure_threshold: 3,
            job_timeout: Duration::from_secs(3600), // 1 hour
            cancel_grace: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: PathBuf::from("/tmp/vgate"),
            command: "ffmpeg".to_string(),
            command_prefix_args: Vec::new(),
            stall_timeout: Duration::from_secs(30),
            cpu_only: false,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from `lookup`. Unset variables keep their defaults;
    /// a variable that is set must parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> WorkerResult<Self> {
        let defaults = Self::default();
        let secs = |name: &str| -> WorkerResult<Option<Duration>> {
            Ok(parse_var::<u64>(&lookup, name)?.map(Duration::from_secs))
        };

        let config = Self {
            poll_interval: parse_var::<u64>(&lookup, "WORKER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            heartbeat_degraded_after: secs("WORKER_HEARTBEAT_DEGRADED_SECS")?
                .unwrap_or(defaults.heartbeat_degraded_after),
            heartbeat_unresponsive_after: secs("WORKER_HEARTBEAT_UNRESPONSIVE_SECS")?
                .unwrap_or(defaults.heartbeat_unresponsive_after),
            failure_threshold: parse_var(&lookup, "WORKER_FAILURE_THRESHOLD")?
                .unwrap_or(defaults.failure_threshold),
            job_timeout: secs("JOB_TIMEOUT_SECS")?.unwrap_or(defaults.job_timeout),
            cancel_grace: secs("WORKER_CANCEL_GRACE_SECS")?.unwrap_or(defaults.cancel_grace),
            shutdown_timeout: secs("WORKER_SHUTDOWN_TIMEOUT")?.unwrap_or(defaults.shutdown_timeout),
            work_dir: lookup("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            command: lookup("WORKER_COMMAND").unwrap_or(defaults.command),
            command_prefix_args: lookup("WORKER_COMMAND_PREFIX_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            stall_timeout: secs("WORKER_STALL_TIMEOUT_SECS")?.unwrap_or(defaults.stall_timeout),
            cpu_only: match lookup("NO_GPU") {
                Some(value) => parse_flag("NO_GPU", &value)?,
                None => defaults.cpu_only,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// All durations and limits must be positive.
    pub fn validate(&self) -> WorkerResult<()> {
        let durations = [
            ("WORKER_POLL_INTERVAL_MS", self.poll_interval),
            ("WORKER_HEARTBEAT_DEGRADED_SECS", self.heartbeat_degraded_after),
            ("WORKER_HEARTBEAT_UNRESPONSIVE_SECS", self.heartbeat_unresponsive_after),
            ("JOB_TIMEOUT_SECS", self.job_timeout),
            ("WORKER_CANCEL_GRACE_SECS", self.cancel_grace),
            ("WORKER_STALL_TIMEOUT_SECS", self.stall_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(WorkerError::config(format!("{} must be positive", name)));
            }
        }

        if self.heartbeat_unresponsive_after < self.heartbeat_degraded_after {
            return Err(WorkerError::config(
                "WORKER_HEARTBEAT_UNRESPONSIVE_SECS must not be below WORKER_HEARTBEAT_DEGRADED_SECS",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(WorkerError::config("WORKER_FAILURE_THRESHOLD must be positive"));
        }
        if self.command.trim().is_empty() {
            return Err(WorkerError::config("WORKER_COMMAND cannot be empty"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> WorkerResult<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| WorkerError::config(format!("{} must be a non-negative integer, got '{}'", name, raw)))
        })
        .transpose()
}

fn parse_flag(name: &str, value: &str) -> WorkerResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(WorkerError::config(format!("{} must be true or false, got '{}'", name, other))),
    }
}
