//! Ledger configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};

/// Storage backend for the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for LedgerBackend {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            "memory" => Ok(LedgerBackend::Memory),
            other => Err(LedgerError::config(format!(
                "LEDGER_BACKEND must be 'postgres' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// PostgreSQL connection string
    pub database_url: Option<String>,
    /// Pool size
    pub max_connections: u32,
    /// Pool acquire timeout
    pub acquire_timeout: Duration,
    /// Rows fetched per page by `list_by_state`
    pub page_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Postgres,
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            page_size: 100,
        }
    }
}

impl LedgerConfig {
    /// In-memory configuration for tests and local development.
    pub fn memory() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> LedgerResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from `lookup`. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LedgerResult<Self> {
        let defaults = Self::default();

        let config = Self {
            backend: match lookup("LEDGER_BACKEND") {
                Some(value) => value.parse()?,
                None => defaults.backend,
            },
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            max_connections: parse_var(&lookup, "LEDGER_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            acquire_timeout: parse_var::<u64>(&lookup, "LEDGER_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            page_size: parse_var(&lookup, "LEDGER_PAGE_SIZE")?.unwrap_or(defaults.page_size),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.backend == LedgerBackend::Postgres && self.database_url.is_none() {
            return Err(LedgerError::config(
                "DATABASE_URL must be set when LEDGER_BACKEND=postgres",
            ));
        }
        if self.max_connections == 0 {
            return Err(LedgerError::config("LEDGER_MAX_CONNECTIONS must be positive"));
        }
        if self.page_size == 0 {
            return Err(LedgerError::config("LEDGER_PAGE_SIZE must be positive"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(LedgerError::config("LEDGER_ACQUIRE_TIMEOUT_SECS must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> LedgerResult<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|_| {
                LedgerError::config(format!("{} must be a non-negative integer, got '{}'", name, raw))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("memory".parse::<LedgerBackend>().unwrap(), LedgerBackend::Memory);
        assert_eq!("Postgres".parse::<LedgerBackend>().unwrap(), LedgerBackend::Postgres);
        assert!("sqlite".parse::<LedgerBackend>().is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            database_url: Some("postgres://localhost/vgate".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(LedgerConfig::memory().validate().is_ok());
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let config = LedgerConfig {
            page_size: 0,
            ..LedgerConfig::memory()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_env_values_rejected() {
        let vars = |name: &'static str, value: &'static str| {
            move |key: &str| match key {
                "LEDGER_BACKEND" => Some("memory".to_string()),
                _ if key == name => Some(value.to_string()),
                _ => None,
            }
        };

        let config = LedgerConfig::from_lookup(vars("LEDGER_PAGE_SIZE", "50")).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_connections, 10);

        for (name, value) in [
            ("LEDGER_PAGE_SIZE", "-20"),
            ("LEDGER_MAX_CONNECTIONS", "lots"),
            ("LEDGER_ACQUIRE_TIMEOUT_SECS", "5s"),
        ] {
            let err = LedgerConfig::from_lookup(vars(name, value)).unwrap_err();
            assert!(err.to_string().contains(name), "{}={} gave {}", name, value, err);
        }
    }
}
