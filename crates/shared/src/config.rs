//! Environment-driven infrastructure configuration
//!
//! Business rules (rates, thresholds, delays) are not read here; they live in
//! the `ledger_config` table and are served by the ledger's config provider.

use std::str::FromStr;
use std::time::Duration;

/// Errors raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" | "" => Ok(LogFormat::Pretty),
            _ => Err(()),
        }
    }
}

/// Infrastructure settings shared by the worker and any other binary
#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when a pooler sits in front of Postgres
    pub database_direct_url: Option<String>,
    pub database_max_connections: u32,
    pub database_acquire_timeout: Duration,
    /// Page size for validation/release batches
    pub ledger_batch_size: i64,
    /// Events claimed per queue poll
    pub event_batch_size: i64,
    /// Maximum delivery attempts before an event is parked as failed
    pub event_max_attempts: i32,
    pub config_cache_ttl: Duration,
    pub run_migrations: bool,
    pub log_format: LogFormat,
}

impl InfraConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5)?,
            database_acquire_timeout: Duration::from_secs(parse_or(
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                5,
            )?),
            ledger_batch_size: parse_or("LEDGER_BATCH_SIZE", 100)?,
            event_batch_size: parse_or("EVENT_BATCH_SIZE", 50)?,
            event_max_attempts: parse_or("EVENT_MAX_ATTEMPTS", 5)?,
            config_cache_ttl: Duration::from_secs(parse_or("CONFIG_CACHE_TTL_SECS", 300)?),
            run_migrations: parse_or("RUN_MIGRATIONS", true)?,
            log_format: std::env::var("LOG_FORMAT")
                .ok()
                .map(|raw| {
                    raw.parse().map_err(|_| ConfigError::Invalid {
                        name: "LOG_FORMAT",
                        value: raw,
                    })
                })
                .transpose()?
                .unwrap_or(LogFormat::Pretty),
        })
    }

    /// URL to run migrations against
    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "DATABASE_URL",
            "DATABASE_DIRECT_URL",
            "DATABASE_MAX_CONNECTIONS",
            "LEDGER_BATCH_SIZE",
            "LOG_FORMAT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        let err = InfraConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ledger");
        let config = InfraConfig::from_env().unwrap();
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.ledger_batch_size, 100);
        assert_eq!(config.config_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.migration_url(), "postgres://localhost/ledger");
        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_number_rejected() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ledger");
        std::env::set_var("LEDGER_BATCH_SIZE", "lots");
        let err = InfraConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "LEDGER_BATCH_SIZE",
                ..
            }
        ));
        clear();
    }

    #[test]
    #[serial]
    fn test_json_log_format() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ledger");
        std::env::set_var("LOG_FORMAT", "JSON");
        std::env::set_var("DATABASE_DIRECT_URL", "postgres://direct/ledger");
        let config = InfraConfig::from_env().unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.migration_url(), "postgres://direct/ledger");
        clear();
        std::env::remove_var("DATABASE_DIRECT_URL");
    }
}
