//! Job domain types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::{InstanceId, JobId, LeaseId};
use super::options::NormalizedOptions;

/// Free-form metadata, round-tripped verbatim and never interpreted.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Job status.
///
/// State transitions:
/// - Waiting -> Active -> Completed
/// - Waiting -> Delayed -> Active -> ...
/// - Active -> Waiting | Delayed (adapter-initiated retry)
/// - Active -> Failed (terminal)
///
/// `paused` is a queue flag, not a job status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Eligible for checkout once its readiness time has come.
    pub fn is_pending(self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
///
/// `data` is opaque to the core. The transition timestamps are written by the
/// adapter, once each, when the job reaches the matching state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job<T = serde_json::Value> {
    pub id: JobId,
    pub name: String,
    pub queue_name: String,
    pub data: T,
    pub status: JobStatus,
    /// Processing attempts so far (the current one included while active).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher runs sooner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl<T> Job<T> {
    /// Replace the payload, keeping every other field.
    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Job<U> {
        self.try_map_data::<U, std::convert::Infallible>(|d| Ok(f(d)))
            .unwrap_or_else(|never| match never {})
    }

    pub fn try_map_data<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Job<U>, E> {
        Ok(Job {
            data: f(self.data)?,
            id: self.id,
            name: self.name,
            queue_name: self.queue_name,
            status: self.status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            created_at: self.created_at,
            processed_at: self.processed_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            failed_reason: self.failed_reason,
            return_value: self.return_value,
            metadata: self.metadata,
        })
    }

    /// True when another attempt is still allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_delayed_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }
}

/// Opaque proof that a worker currently owns a checked-out job.
///
/// Issued by one adapter instance, valid only there, and only until the job
/// is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    job_id: JobId,
    lease: LeaseId,
    issuer: InstanceId,
}

impl LeaseToken {
    pub fn issue(job_id: JobId, issuer: InstanceId) -> Self {
        Self {
            job_id,
            lease: LeaseId::new(),
            issuer,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    pub fn issuer(&self) -> InstanceId {
        self.issuer
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lease, self.job_id)
    }
}

/// A job checked out to a worker. Never persisted by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveJob<T = serde_json::Value> {
    pub job: Job<T>,
    pub provider_metadata: LeaseToken,
}

impl<T> ActiveJob<T> {
    pub fn new(job: Job<T>, provider_metadata: LeaseToken) -> Self {
        Self {
            job,
            provider_metadata,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn data(&self) -> &T {
        &self.job.data
    }

    pub fn token(&self) -> &LeaseToken {
        &self.provider_metadata
    }

    pub fn try_map_data<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<ActiveJob<U>, (LeaseToken, E)> {
        let token = self.provider_metadata;
        match self.job.try_map_data(f) {
            Ok(job) => Ok(ActiveJob::new(job, token)),
            Err(e) => Err((token, e)),
        }
    }
}

/// Queue names must be non-empty and free of surrounding whitespace.
pub fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.trim().is_empty() {
        return Err(QueueError::invalid_option("queue name must not be empty"));
    }
    if name.trim() != name {
        return Err(QueueError::invalid_option(format!(
            "queue name `{name}` has leading or trailing whitespace"
        )));
    }
    Ok(())
}

/// A job to be added: name, payload and resolved options.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub data: serde_json::Value,
    pub options: NormalizedOptions,
}

/// What the adapter decided after a failure report.
///
/// Authoritative: the core republishes it without recomputing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackOutcome {
    pub will_retry: bool,
    /// Attempts made so far, the failed one included.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Job<serde_json::Value> {
        Job {
            id: JobId::new("1"),
            name: "send-email".into(),
            queue_name: "mail".into(),
            data: serde_json::json!({"to": "a@example.com"}),
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: 3,
            priority: None,
            scheduled_for: None,
            created_at: None,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            failed_reason: None,
            return_value: None,
            metadata: Metadata::new(),
        }
    }

    #[rstest]
    #[case::waiting(JobStatus::Waiting, false)]
    #[case::delayed(JobStatus::Delayed, false)]
    #[case::active(JobStatus::Active, false)]
    #[case::completed(JobStatus::Completed, true)]
    #[case::failed(JobStatus::Failed, true)]
    fn terminal_states(#[case] status: JobStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn map_data_keeps_identity() {
        let job = sample().map_data(|v| v["to"].as_str().unwrap_or_default().to_string());
        assert_eq!(job.data, "a@example.com");
        assert_eq!(job.id.as_str(), "1");
        assert_eq!(job.queue_name, "mail");
    }

    #[test]
    fn job_serializes_camel_case() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["queueName"], "mail");
        assert_eq!(v["maxAttempts"], 3);
        assert_eq!(v["status"], "waiting");
    }

    #[rstest]
    #[case::empty("", false)]
    #[case::blank("   ", false)]
    #[case::padded(" mail", false)]
    #[case::ok("mail", true)]
    fn queue_name_validation(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_queue_name(name).is_ok(), ok);
    }

    #[test]
    fn lease_tokens_are_unique_per_issue() {
        let issuer = InstanceId::new();
        let a = LeaseToken::issue(JobId::new("1"), issuer);
        let b = LeaseToken::issue(JobId::new("1"), issuer);
        assert_ne!(a, b);
        assert_eq!(a.issuer(), b.issuer());
    }
}
