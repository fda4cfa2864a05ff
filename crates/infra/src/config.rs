//! Configuration loading and representation.
//!
//! Values come from the host's settings store (deserialized) or from
//! `DOCQUEUE_*` environment variables; every field has a default.

use std::time::Duration;

use docqueue_observability::LogFormat;
use serde::Deserialize;
use thiserror::Error;

use crate::queue::{BackoffStrategy, RetryPolicy, WorkerConfig};

pub const ENV_BACKGROUND_PROCESSING: &str = "DOCQUEUE_BACKGROUND_PROCESSING";
pub const ENV_MAX_RETRIES: &str = "DOCQUEUE_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "DOCQUEUE_RETRY_DELAY_MS";
pub const ENV_RETRY_BACKOFF: &str = "DOCQUEUE_RETRY_BACKOFF";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "DOCQUEUE_RETRY_MAX_DELAY_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "DOCQUEUE_POLL_INTERVAL_MS";
pub const ENV_WORKER_NAME: &str = "DOCQUEUE_WORKER_NAME";
pub const ENV_LOG_FORMAT: &str = "DOCQUEUE_LOG_FORMAT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for deferred document delivery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Master switch. When off nothing is withheld or queued.
    pub background_processing: bool,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before a retry.
    pub retry_delay_ms: u64,
    /// How the delay grows per retry.
    pub retry_backoff: BackoffStrategy,
    /// Upper bound for a grown delay.
    pub retry_max_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub worker_name: String,
    pub log_format: LogFormat,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            background_processing: true,
            max_retries: 2,
            retry_delay_ms: 0,
            retry_backoff: BackoffStrategy::Fixed,
            retry_max_delay_ms: 300_000,
            poll_interval_ms: 500,
            worker_name: "docqueue-worker".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl QueueConfig {
    /// Load from `DOCQUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using an arbitrary variable lookup (unset = default).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_BACKGROUND_PROCESSING) {
            config.background_processing = parse_bool(ENV_BACKGROUND_PROCESSING, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            config.max_retries = parse_number(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_DELAY_MS) {
            config.retry_delay_ms = parse_number(ENV_RETRY_DELAY_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_BACKOFF) {
            config.retry_backoff = v
                .parse()
                .map_err(|reason: String| invalid(ENV_RETRY_BACKOFF, &v, reason))?;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_DELAY_MS) {
            config.retry_max_delay_ms = parse_number(ENV_RETRY_MAX_DELAY_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKER_NAME) {
            let name = v.trim();
            if name.is_empty() {
                return Err(invalid(ENV_WORKER_NAME, &v, "must not be empty"));
            }
            config.worker_name = name.to_string();
        }
        if let Some(v) = lookup(ENV_LOG_FORMAT) {
            config.log_format = v
                .parse()
                .map_err(|reason: String| invalid(ENV_LOG_FORMAT, &v, reason))?;
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.retry_delay_ms)).with_backoff(
            self.retry_backoff,
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(self.worker_name.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, value, e.to_string()))
}
