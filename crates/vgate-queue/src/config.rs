//! Queue configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Order in which Pending jobs are considered for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Admit the oldest job that fits, skipping larger ones ahead of it
    #[default]
    FirstFit,
    /// Only the head of the queue may be admitted
    StrictFifo,
}

impl AdmissionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionPolicy::FirstFit => "first_fit",
            AdmissionPolicy::StrictFifo => "strict_fifo",
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_fit" => Ok(AdmissionPolicy::FirstFit),
            "strict_fifo" | "fifo" => Ok(AdmissionPolicy::StrictFifo),
            other => Err(QueueError::config(format!(
                "ADMISSION_POLICY must be 'first_fit' or 'strict_fifo', got '{}'",
                other
            ))),
        }
    }
}

/// Where slots, claims and the pending queue live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" | "valkey" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(QueueError::config(format!(
                "STORE_BACKEND must be 'redis' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: StoreBackend,
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every Redis key
    pub key_prefix: String,
    pub policy: AdmissionPolicy,
    /// Requeues allowed before a job is failed
    pub max_attempts: u32,
    /// Lock expiry, in case the holder dies
    pub lock_ttl: Duration,
    /// How long to wait for the lock before `LockTimeout`
    pub lock_wait: Duration,
    /// Sleep between lock attempts
    pub lock_retry_interval: Duration,
    /// Pending entries examined per admission attempt
    pub scan_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vgate".to_string(),
            policy: AdmissionPolicy::FirstFit,
            max_attempts: 3,
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(2),
            lock_retry_interval: Duration::from_millis(10),
            scan_limit: 256,
        }
    }
}

impl QueueConfig {
    /// In-memory configuration for tests and local development.
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Create config from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from `lookup`. A variable that is set must parse;
    /// only unset ones fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let defaults = Self::default();
        let millis = |name: &str| -> QueueResult<Option<Duration>> {
            Ok(parse_var::<u64>(&lookup, name)?.map(Duration::from_millis))
        };

        let config = Self {
            backend: match lookup("STORE_BACKEND") {
                Some(value) => value.parse()?,
                None => defaults.backend,
            },
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("REDIS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            policy: match lookup("ADMISSION_POLICY") {
                Some(value) => value.parse()?,
                None => defaults.policy,
            },
            max_attempts: parse_var(&lookup, "JOB_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            lock_ttl: millis("ADMISSION_LOCK_TTL_MS")?.unwrap_or(defaults.lock_ttl),
            lock_wait: millis("ADMISSION_LOCK_WAIT_MS")?.unwrap_or(defaults.lock_wait),
            lock_retry_interval: defaults.lock_retry_interval,
            scan_limit: parse_var(&lookup, "ADMISSION_SCAN_LIMIT")?.unwrap_or(defaults.scan_limit),
        };

        config.validate()?;
        Ok(config)
    }

    /// All limits must be explicit and positive.
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::config("JOB_MAX_ATTEMPTS must be positive"));
        }
        if self.lock_ttl.is_zero() || self.lock_wait.is_zero() {
            return Err(QueueError::config("admission lock TTL and wait must be positive"));
        }
        if self.scan_limit == 0 {
            return Err(QueueError::config("ADMISSION_SCAN_LIMIT must be positive"));
        }
        if self.key_prefix.is_empty() {
            return Err(QueueError::config("REDIS_KEY_PREFIX cannot be empty"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> QueueResult<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|_| {
                QueueError::config(format!("{} must be a non-negative integer, got '{}'", name, raw))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("first_fit".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::FirstFit);
        assert_eq!("strict-fifo".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::StrictFifo);
        assert!("random".parse::<AdmissionPolicy>().is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
        assert_eq!(QueueConfig::default().policy, AdmissionPolicy::FirstFit);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = QueueConfig::memory().with_max_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_values_parsed() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("STORE_BACKEND", "memory"),
            ("JOB_MAX_ATTEMPTS", "5"),
            ("ADMISSION_LOCK_TTL_MS", "2500"),
        ]))
        .unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.lock_ttl, Duration::from_millis(2500));
        assert_eq!(config.scan_limit, QueueConfig::default().scan_limit);
    }

    #[test]
    fn test_malformed_env_values_rejected() {
        for (name, value) in [
            ("JOB_MAX_ATTEMPTS", "-1"),
            ("JOB_MAX_ATTEMPTS", "three"),
            ("ADMISSION_LOCK_WAIT_MS", "1.5"),
            ("ADMISSION_SCAN_LIMIT", ""),
        ] {
            let vars = [("STORE_BACKEND", "memory"), (name, value)];
            let err = QueueConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(err.to_string().contains(name), "{}={:?} gave {}", name, value, err);
        }
    }
}
