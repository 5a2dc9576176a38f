//! Configuration records.
//!
//! Everything here deserializes from JSON with `#[serde(default)]`, so a
//! config file only needs the keys it changes. Durations are written in
//! milliseconds.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{JobDefaults, ProviderCapabilities, QueueError, Result};
use crate::impls::memory::RetryPolicy;

/// `Duration` <-> integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

fn parse<T: DeserializeOwned>(what: &str, json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| {
        QueueError::invalid_option(format!("invalid {what}: {e}")).with_cause(std::sync::Arc::new(e))
    })
}

fn check_defaults(defaults: &JobDefaults) -> Result<()> {
    if defaults.attempts == Some(0) {
        return Err(QueueError::invalid_option("default attempts must be at least 1"));
    }
    if let Some(priority) = defaults.priority
        && priority < 0
    {
        return Err(QueueError::invalid_option(format!(
            "default priority must be non-negative, got {priority}"
        )));
    }
    Ok(())
}

/// Client-side queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Queue-level job defaults, layered over the adapter's.
    pub defaults: JobDefaults,
    /// Pool size used by `Worker::process` when none is given.
    pub concurrency: usize,
    #[serde(rename = "shutdownTimeoutMs", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Broadcast buffer of the event channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            defaults: JobDefaults::default(),
            concurrency: 1,
            shutdown_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = parse("queue config", json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueueError::invalid_option("concurrency must be at least 1"));
        }
        check_defaults(&self.defaults)
    }
}

/// Settings of the in-memory adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryProviderConfig {
    pub capabilities: ProviderCapabilities,
    pub retry: RetryPolicy,
    /// Upper bound for a long-polling `fetch` (only with `supportsLongPolling`).
    #[serde(rename = "longPollTimeoutMs", with = "duration_ms")]
    pub long_poll_timeout: Duration,
    /// Idle re-check interval of push-mode workers.
    #[serde(rename = "pollIntervalMs", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Adapter-level job defaults.
    pub defaults: JobDefaults,
}

impl Default for MemoryProviderConfig {
    fn default() -> Self {
        Self {
            capabilities: ProviderCapabilities::default(),
            retry: RetryPolicy::default(),
            long_poll_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            defaults: JobDefaults::default(),
        }
    }
}

impl MemoryProviderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = parse("memory provider config", json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(QueueError::invalid_option(format!(
                "retry multiplier must be finite and >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::invalid_option("poll interval must be positive"));
        }
        check_defaults(&self.defaults)
    }
}
