//! Provider capability flags.

use serde::{Deserialize, Serialize};

use super::errors::{QueueError, Result};
use super::options::NormalizedOptions;

/// What an adapter instance supports. Fixed for the instance's lifetime.
///
/// The client checks these before calling the adapter and fails with a
/// configuration error instead of degrading silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub supports_delayed_jobs: bool,
    pub supports_priority: bool,
    pub supports_retries: bool,
    #[serde(rename = "supportsDLQ")]
    pub supports_dlq: bool,
    pub supports_batching: bool,
    pub supports_long_polling: bool,
    /// Maximum serialized payload size in bytes.
    pub max_job_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub max_delay_seconds: Option<u64>,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_delayed_jobs: true,
            supports_priority: true,
            supports_retries: true,
            supports_dlq: true,
            supports_batching: true,
            supports_long_polling: false,
            max_job_size: None,
            max_batch_size: None,
            max_delay_seconds: None,
        }
    }
}

impl ProviderCapabilities {
    /// Nothing optional: no delays, priority, retries, DLQ or batching.
    pub fn minimal() -> Self {
        Self {
            supports_delayed_jobs: false,
            supports_priority: false,
            supports_retries: false,
            supports_dlq: false,
            supports_batching: false,
            supports_long_polling: false,
            max_job_size: None,
            max_batch_size: None,
            max_delay_seconds: None,
        }
    }

    /// Fail fast when `options` need something this adapter lacks.
    pub fn check_options(&self, options: &NormalizedOptions) -> Result<()> {
        if options.is_delayed() {
            if !self.supports_delayed_jobs {
                return Err(QueueError::unsupported("delayed jobs"));
            }
            if let Some(max) = self.max_delay_seconds
                && options.delay.as_secs_f64() > max as f64
            {
                return Err(QueueError::invalid_option(format!(
                    "delay of {:?} exceeds the provider maximum of {max}s",
                    options.delay
                )));
            }
        }
        if options.priority.is_some() && !self.supports_priority {
            return Err(QueueError::unsupported("job priority"));
        }
        if options.attempts > 1 && !self.supports_retries {
            return Err(QueueError::unsupported("retries (attempts > 1)"));
        }
        Ok(())
    }

    pub fn check_batch(&self, len: usize) -> Result<()> {
        if !self.supports_batching {
            return Err(QueueError::unsupported("batch add"));
        }
        if let Some(max) = self.max_batch_size
            && len > max
        {
            return Err(QueueError::invalid_option(format!(
                "batch of {len} jobs exceeds the provider maximum of {max}"
            )));
        }
        Ok(())
    }

    pub fn require_dlq(&self) -> Result<()> {
        if self.supports_dlq {
            Ok(())
        } else {
            Err(QueueError::unsupported("dead-letter queue"))
        }
    }

    pub fn require_retries(&self) -> Result<()> {
        if self.supports_retries {
            Ok(())
        } else {
            Err(QueueError::unsupported("retries"))
        }
    }
}
