//! Job options and their normalization.
//!
//! Callers hand in a loose [`JobOptions`]; the client resolves it against
//! queue and adapter defaults into a [`NormalizedOptions`] before any backend
//! call. Identity-affecting fields (`job_id`, `attempts`, delay) only exist
//! on the normalized record; [`ProviderOptions`] has no field that could
//! express them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{QueueError, Result};
use super::ids::JobId;
use super::job::Metadata;
use crate::ports::JobIdGenerator;

/// What to keep once a job reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "count")]
pub enum Retention {
    #[default]
    Keep,
    Remove,
    /// Keep only the most recent `n` jobs in that terminal state.
    KeepLast(usize),
}

/// Explicit id or a generator.
#[derive(Clone)]
pub enum JobIdSource {
    Explicit(JobId),
    Generator(Arc<dyn JobIdGenerator>),
}

impl JobIdSource {
    fn resolve(&self) -> JobId {
        match self {
            JobIdSource::Explicit(id) => id.clone(),
            JobIdSource::Generator(id_gen) => id_gen.generate(),
        }
    }
}

impl fmt::Debug for JobIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobIdSource::Explicit(id) => f.debug_tuple("Explicit").field(id).finish(),
            JobIdSource::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// Backend-specific tuning.
///
/// Deliberately typed: there is no way to spell `job_id`, `attempts` or a
/// delay here. `remove_on_complete` is the one normalized field it may
/// override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<Retention>,
    /// Dispatch ahead of equal-priority peers.
    pub lifo: bool,
}

impl ProviderOptions {
    pub fn remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = Some(retention);
        self
    }

    pub fn lifo(mut self) -> Self {
        self.lifo = true;
        self
    }
}

/// Per-call options. Every field is optional; unset fields fall back to
/// queue defaults, then adapter defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: Option<JobIdSource>,
    pub attempts: Option<u32>,
    /// Milliseconds. Kept as `f64` so non-finite input is representable and
    /// can be rejected instead of silently clamped.
    pub delay_ms: Option<f64>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
    pub metadata: Metadata,
    pub provider_options: ProviderOptions,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(JobIdSource::Explicit(id.into()));
        self
    }

    pub fn job_id_generator(mut self, id_gen: Arc<dyn JobIdGenerator>) -> Self {
        self.job_id = Some(JobIdSource::Generator(id_gen));
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_secs_f64() * 1_000.0);
        self
    }

    pub fn delay_ms(mut self, delay_ms: f64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = Some(retention);
        self
    }

    pub fn remove_on_fail(mut self, retention: Retention) -> Self {
        self.remove_on_fail = Some(retention);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn provider_options(mut self, provider_options: ProviderOptions) -> Self {
        self.provider_options = provider_options;
        self
    }

    /// Fill unset fields from `defaults`. Fields set here win.
    pub fn merged_over(mut self, defaults: &JobDefaults) -> Self {
        self.attempts = self.attempts.or(defaults.attempts);
        self.priority = self.priority.or(defaults.priority);
        self.remove_on_complete = self.remove_on_complete.or(defaults.remove_on_complete);
        self.remove_on_fail = self.remove_on_fail.or(defaults.remove_on_fail);
        self
    }

    /// Validate and resolve into a [`NormalizedOptions`].
    ///
    /// `fallback_generator` is used when no id source was given; `now` anchors
    /// `run_at`.
    pub fn normalize(
        &self,
        defaults: &JobDefaults,
        fallback_generator: &dyn JobIdGenerator,
        now: DateTime<Utc>,
    ) -> Result<NormalizedOptions> {
        let merged = self.clone().merged_over(defaults);

        let attempts = merged.attempts.unwrap_or(DEFAULT_ATTEMPTS);
        if attempts == 0 {
            return Err(QueueError::invalid_option("attempts must be at least 1"));
        }
        if let Some(priority) = merged.priority
            && priority < 0
        {
            return Err(QueueError::invalid_option(format!(
                "priority must be non-negative, got {priority}"
            )));
        }

        let delay = match (merged.delay_ms, merged.run_at) {
            (Some(_), Some(_)) => {
                return Err(QueueError::invalid_option(
                    "delay and run_at are mutually exclusive",
                ));
            }
            (Some(ms), None) => validate_delay_ms(ms)?,
            (None, Some(at)) => delay_until(at, now),
            (None, None) => Duration::ZERO,
        };

        let job_id = match &merged.job_id {
            Some(source) => source.resolve(),
            None => fallback_generator.generate(),
        };
        if job_id.as_str().is_empty() {
            return Err(QueueError::invalid_option("job id must not be empty"));
        }

        // provider_options may only touch remove_on_complete.
        let remove_on_complete = merged
            .provider_options
            .remove_on_complete
            .or(merged.remove_on_complete)
            .unwrap_or_default();

        Ok(NormalizedOptions {
            job_id,
            attempts,
            delay,
            priority: merged.priority,
            remove_on_complete,
            remove_on_fail: merged.remove_on_fail.unwrap_or_default(),
            lifo: merged.provider_options.lifo,
            metadata: merged.metadata,
        })
    }
}

/// Attempts used when neither call, queue nor adapter set one.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Defaults merged under per-call options (queue level or adapter level).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<Retention>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<Retention>,
}

impl JobDefaults {
    /// Layer `self` over `lower`; values in `self` win.
    pub fn over(&self, lower: &JobDefaults) -> JobDefaults {
        JobDefaults {
            attempts: self.attempts.or(lower.attempts),
            priority: self.priority.or(lower.priority),
            remove_on_complete: self.remove_on_complete.or(lower.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(lower.remove_on_fail),
        }
    }
}

/// Fully resolved options handed to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOptions {
    pub job_id: JobId,
    pub attempts: u32,
    pub delay: Duration,
    pub priority: Option<i32>,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    pub lifo: bool,
    pub metadata: Metadata,
}

impl NormalizedOptions {
    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Absolute schedule for this delay, relative to `now`.
    pub fn scheduled_for(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_delayed() {
            return None;
        }
        chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
    }
}

fn validate_delay_ms(ms: f64) -> Result<Duration> {
    if !ms.is_finite() {
        return Err(QueueError::invalid_option(format!(
            "delay must be finite, got {ms}"
        )));
    }
    if ms < 0.0 {
        return Err(QueueError::invalid_option(format!(
            "delay must be non-negative, got {ms}"
        )));
    }
    Duration::try_from_secs_f64(ms / 1_000.0)
        .map_err(|e| QueueError::invalid_option(format!("delay out of range: {e}")))
}

/// Translate an absolute schedule into a delay relative to `now`.
///
/// Past instants translate to zero.
pub fn delay_until(scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (scheduled_for - now).to_std().unwrap_or(Duration::ZERO)
}
