//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The Redis URL is wrapped in `secrecy::SecretString` because it
//! may embed a password.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::lock::LockConfig;
use crate::queue::QueueConfig;
use crate::telemetry::TelemetryConfig;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset optional variables fall back to the [`QueueConfig`] and
    /// [`LockConfig`] defaults.
    pub fn from_env() -> Result<Self> {
        let queue_defaults = QueueConfig::default();
        let lock_defaults = LockConfig::default();

        let queue = QueueConfig {
            prefix: std::env::var("STREAMQ_PREFIX").unwrap_or(queue_defaults.prefix),
            stuck_timeout: optional_secs("STREAMQ_STUCK_TIMEOUT_SECS")?
                .unwrap_or(queue_defaults.stuck_timeout),
            stuck_check_interval: optional_secs("STREAMQ_STUCK_CHECK_INTERVAL_SECS")?
                .unwrap_or(queue_defaults.stuck_check_interval),
            stuck_batch_size: optional_parsed("STREAMQ_STUCK_BATCH_SIZE")?
                .unwrap_or(queue_defaults.stuck_batch_size),
        };
        if queue.stuck_batch_size == 0 {
            return Err(Error::Config(
                "STREAMQ_STUCK_BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        let lock = LockConfig {
            prefix: std::env::var("STREAMQ_LOCK_PREFIX").unwrap_or(lock_defaults.prefix),
            ttl: optional_secs("STREAMQ_LOCK_TTL_SECS")?.unwrap_or(lock_defaults.ttl),
            retry_wait: optional_parsed("STREAMQ_LOCK_RETRY_WAIT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(lock_defaults.retry_wait),
        };

        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            queue,
            lock,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Like [`Config::from_env`], reading a `.env` file first if present.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn telemetry_config(&self, service_name: impl Into<String>) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: self.log_level.clone(),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn optional_secs(name: &str) -> Result<Option<Duration>> {
    Ok(optional_parsed::<u64>(name)?.map(Duration::from_secs))
}
