//! Runtime configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `OUTBOX_WORKER_ID` | `$HOSTNAME:<random hex>` |
//! | `OUTBOX_TOPIC` | `accounts.outbox` |
//! | `OUTBOX_BATCH_SIZE` | `50` |
//! | `OUTBOX_LEASE_SECS` | `30` |
//! | `OUTBOX_IDLE_INTERVAL_MS` | `2000` |
//! | `OUTBOX_BATCH_PAUSE_MS` | `200` |
//! | `OUTBOX_MAX_ATTEMPTS` | `10` |
//! | `OUTBOX_BASE_BACKOFF_MS` | `2000` |
//! | `OUTBOX_MAX_BACKOFF_SECS` | `300` |
//! | `OUTBOX_CLAIM_STRATEGY` | `per_row` |
//! | `KAFKA_BOOTSTRAP_SERVERS` | `localhost:9092` |
//! | `KAFKA_CLIENT_ID` | `bankrelay-outbox` |
//! | `KAFKA_MESSAGE_TIMEOUT_MS` | `5000` |
//!
//! Leases must be between one second and [`MAX_LEASE`]. Backoffs may not
//! exceed [`BACKOFF_LIMIT`].

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::{BACKOFF_LIMIT, ClaimStrategy, RetryPolicy};

pub const MIN_LEASE: Duration = Duration::from_secs(1);
pub const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Outbox processor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Lease holder id; must be unique per running processor.
    pub worker_id: String,
    pub topic: String,
    pub batch_size: usize,
    pub lease: Duration,
    /// Sleep after an empty claim or a store error.
    pub idle_interval: Duration,
    /// Sleep after a non-empty batch.
    pub batch_pause: Duration,
    pub retry: RetryPolicy,
    pub claim_strategy: ClaimStrategy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            topic: "accounts.outbox".to_string(),
            batch_size: 50,
            lease: Duration::from_secs(30),
            idle_interval: Duration::from_secs(2),
            batch_pause: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            claim_strategy: ClaimStrategy::default(),
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden by any `OUTBOX_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`OutboxConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "OUTBOX_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_backoff: millis_or(&lookup, "OUTBOX_BASE_BACKOFF_MS", defaults.retry.base_backoff)?,
            max_backoff: secs_or(&lookup, "OUTBOX_MAX_BACKOFF_SECS", defaults.retry.max_backoff)?,
        };
        if retry.max_attempts == 0 {
            return Err(invalid("OUTBOX_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        within("OUTBOX_BASE_BACKOFF_MS", retry.base_backoff, Duration::ZERO, BACKOFF_LIMIT)?;
        within("OUTBOX_MAX_BACKOFF_SECS", retry.max_backoff, Duration::ZERO, BACKOFF_LIMIT)?;

        let lease = secs_or(&lookup, "OUTBOX_LEASE_SECS", defaults.lease)?;
        within("OUTBOX_LEASE_SECS", lease, MIN_LEASE, MAX_LEASE)?;

        let batch_size = parse_or(&lookup, "OUTBOX_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("OUTBOX_BATCH_SIZE", "0", "must be at least 1"));
        }

        Ok(Self {
            worker_id: lookup("OUTBOX_WORKER_ID").unwrap_or(defaults.worker_id),
            topic: lookup("OUTBOX_TOPIC").unwrap_or(defaults.topic),
            batch_size,
            lease,
            idle_interval: millis_or(&lookup, "OUTBOX_IDLE_INTERVAL_MS", defaults.idle_interval)?,
            batch_pause: millis_or(&lookup, "OUTBOX_BATCH_PAUSE_MS", defaults.batch_pause)?,
            retry,
            claim_strategy: parse_or(&lookup, "OUTBOX_CLAIM_STRATEGY", defaults.claim_strategy)?,
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn with_batch_pause(mut self, batch_pause: Duration) -> Self {
        self.batch_pause = batch_pause;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_strategy(mut self, claim_strategy: ClaimStrategy) -> Self {
        self.claim_strategy = claim_strategy;
        self
    }
}

/// Kafka producer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub message_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "bankrelay-outbox".to_string(),
            message_timeout: Duration::from_secs(5),
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bootstrap_servers: lookup("KAFKA_BOOTSTRAP_SERVERS").unwrap_or(defaults.bootstrap_servers),
            client_id: lookup("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id),
            message_timeout: millis_or(&lookup, "KAFKA_MESSAGE_TIMEOUT_MS", defaults.message_timeout)?,
        })
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "outbox-processor".to_string());
    format!("{host}:{}", uuid::Uuid::now_v7().simple())
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn within(
    var: &'static str,
    value: Duration,
    min: Duration,
    max: Duration,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(invalid(
            var,
            &format!("{value:?}"),
            format!("must be between {min:?} and {max:?}"),
        ));
    }
    Ok(())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        Some(_) => parse_or(lookup, var, 0u64).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        Some(_) => parse_or(lookup, var, 0u64).map(Duration::from_secs),
        None => Ok(default),
    }
}
