//! Runtime configuration, usually read from `REPORTQ_*` environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `REPORTQ_REDIS_URL` | `redis://127.0.0.1:6379`, use `rediss://` for TLS |
//! | `REPORTQ_QUEUE` | `reports` |
//! | `REPORTQ_MAX_ATTEMPTS` | `3` |
//! | `REPORTQ_COMPLETED_RETENTION` | `100` |
//! | `REPORTQ_FAILED_RETENTION` | `50` |
//! | `REPORTQ_POLL_TIMEOUT_MS` | `1000` |
//! | `REPORTQ_WORKERS` | `1` |
//! | `REPORTQ_VISIBILITY_TIMEOUT_SECS` | `300` |
use std::{str::FromStr, time::Duration};

use chrono::TimeDelta;
use thiserror::Error;

use crate::{backend::Retention, reaper::ReaperConfig, retry::RetryPolicy, worker::WorkerConfig};

pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE_NAME: &str = "reports";

const STORE_URL: &str = "REPORTQ_REDIS_URL";
const QUEUE_NAME: &str = "REPORTQ_QUEUE";
const MAX_ATTEMPTS: &str = "REPORTQ_MAX_ATTEMPTS";
const COMPLETED_RETENTION: &str = "REPORTQ_COMPLETED_RETENTION";
const FAILED_RETENTION: &str = "REPORTQ_FAILED_RETENTION";
const POLL_TIMEOUT_MS: &str = "REPORTQ_POLL_TIMEOUT_MS";
const WORKERS: &str = "REPORTQ_WORKERS";
const VISIBILITY_TIMEOUT_SECS: &str = "REPORTQ_VISIBILITY_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Connection URL of the queue store, credentials included.
    pub store_url: String,
    /// Namespaces the store keys, so several queues can share one server.
    pub queue_name: String,
    pub retry: RetryPolicy,
    pub retention: Retention,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_owned(),
            queue_name: DEFAULT_QUEUE_NAME.to_owned(),
            retry: RetryPolicy::default(),
            retention: Retention::default(),
            worker: WorkerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to the default for every missing key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut config = Self {
            store_url: lookup(STORE_URL).unwrap_or(defaults.store_url),
            queue_name: lookup(QUEUE_NAME).unwrap_or(defaults.queue_name),
            ..defaults
        };

        if let Some(max_attempts) = parse::<u16>(&lookup, MAX_ATTEMPTS)? {
            if max_attempts == 0 {
                return Err(ConfigError::invalid(MAX_ATTEMPTS, max_attempts));
            }
            config.retry = config.retry.with_max_attempts(max_attempts);
        }
        if let Some(completed) = parse(&lookup, COMPLETED_RETENTION)? {
            config.retention.completed = completed;
        }
        if let Some(failed) = parse(&lookup, FAILED_RETENTION)? {
            config.retention.failed = failed;
        }
        if let Some(millis) = parse(&lookup, POLL_TIMEOUT_MS)? {
            config.worker.poll_timeout = Duration::from_millis(millis);
        }
        if let Some(workers) = parse::<usize>(&lookup, WORKERS)? {
            if workers == 0 {
                return Err(ConfigError::invalid(WORKERS, workers));
            }
            config.worker.workers = workers;
        }
        if let Some(secs) = parse::<u32>(&lookup, VISIBILITY_TIMEOUT_SECS)? {
            config.reaper.visibility_timeout = TimeDelta::seconds(secs.into());
        }

        if config.queue_name.is_empty() {
            return Err(ConfigError::invalid(QUEUE_NAME, ""));
        }
        Ok(config)
    }

    pub fn with_store_url(self, store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            ..self
        }
    }

    pub fn with_queue_name(self, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..self
        }
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn with_retention(self, retention: Retention) -> Self {
        Self { retention, ..self }
    }

    pub fn with_worker(self, worker: WorkerConfig) -> Self {
        Self { worker, ..self }
    }

    pub fn with_reaper(self, reaper: ReaperConfig) -> Self {
        Self { reaper, ..self }
    }

    /// Whether the store URL asks for a TLS connection.
    pub fn uses_tls(&self) -> bool {
        self.store_url.starts_with("rediss://")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
        }
    }
}
