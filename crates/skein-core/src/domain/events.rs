//! Events - キューのライフサイクルイベント
//!
//! The event set is closed: every variant has a fixed payload shape and a
//! dotted wire name (`job.retrying`, `queue.error`, ...).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorInfo;
use super::ids::JobId;
use super::job::{Job, NackOutcome};

/// Lifecycle notifications published on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// A job was checked out to a worker.
    #[serde(rename = "active")]
    JobActive {
        queue: String,
        job_id: JobId,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job finished successfully.
    #[serde(rename = "completed")]
    JobCompleted {
        queue: String,
        job_id: JobId,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    /// A job failed and the adapter will not run it again.
    #[serde(rename = "failed")]
    JobFailed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        max_attempts: u32,
        error: ErrorInfo,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A job failed and the adapter scheduled another attempt.
    #[serde(rename = "job.retrying")]
    JobRetrying {
        queue: String,
        job_id: JobId,
        attempts: u32,
        max_attempts: u32,
        error: ErrorInfo,
        will_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "processor.shutting_down")]
    ProcessorShuttingDown {
        queue: String,
        in_flight: usize,
        timestamp: DateTime<Utc>,
    },
    /// Drain did not finish in time; remaining handlers were abandoned.
    #[serde(rename = "processor.shutdown_timeout")]
    ProcessorShutdownTimeout {
        queue: String,
        timeout_ms: u64,
        abandoned: usize,
        timestamp: DateTime<Utc>,
    },
    /// Backend-originated failure or a failing safe listener.
    #[serde(rename = "queue.error")]
    QueueError {
        queue: String,
        error: ErrorInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_event: Option<QueueEventKind>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "queue.drained")]
    QueueDrained {
        queue: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "queue.paused")]
    QueuePaused {
        queue: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "queue.resumed")]
    QueueResumed {
        queue: String,
        timestamp: DateTime<Utc>,
    },
}

/// Event names, used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueEventKind {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "job.retrying")]
    JobRetrying,
    #[serde(rename = "processor.shutting_down")]
    ProcessorShuttingDown,
    #[serde(rename = "processor.shutdown_timeout")]
    ProcessorShutdownTimeout,
    #[serde(rename = "queue.error")]
    QueueError,
    #[serde(rename = "queue.drained")]
    QueueDrained,
    #[serde(rename = "queue.paused")]
    QueuePaused,
    #[serde(rename = "queue.resumed")]
    QueueResumed,
}

impl QueueEventKind {
    pub const ALL: [QueueEventKind; 10] = [
        QueueEventKind::Active,
        QueueEventKind::Completed,
        QueueEventKind::Failed,
        QueueEventKind::JobRetrying,
        QueueEventKind::ProcessorShuttingDown,
        QueueEventKind::ProcessorShutdownTimeout,
        QueueEventKind::QueueError,
        QueueEventKind::QueueDrained,
        QueueEventKind::QueuePaused,
        QueueEventKind::QueueResumed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueEventKind::Active => "active",
            QueueEventKind::Completed => "completed",
            QueueEventKind::Failed => "failed",
            QueueEventKind::JobRetrying => "job.retrying",
            QueueEventKind::ProcessorShuttingDown => "processor.shutting_down",
            QueueEventKind::ProcessorShutdownTimeout => "processor.shutdown_timeout",
            QueueEventKind::QueueError => "queue.error",
            QueueEventKind::QueueDrained => "queue.drained",
            QueueEventKind::QueuePaused => "queue.paused",
            QueueEventKind::QueueResumed => "queue.resumed",
        }
    }
}

impl fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl QueueEvent {
    pub fn active<T>(job: &Job<T>, timestamp: DateTime<Utc>) -> Self {
        QueueEvent::JobActive {
            queue: job.queue_name.clone(),
            job_id: job.id.clone(),
            attempts: job.attempts,
            timestamp,
        }
    }

    pub fn completed<T>(
        job: &Job<T>,
        result: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let duration_ms = job
            .processed_at
            .and_then(|started| (timestamp - started).to_std().ok())
            .map(|d| d.as_millis() as u64);
        QueueEvent::JobCompleted {
            queue: job.queue_name.clone(),
            job_id: job.id.clone(),
            attempts: job.attempts,
            duration_ms,
            result,
            timestamp,
        }
    }

    /// `job.retrying` when the adapter will retry, `failed` otherwise.
    ///
    /// Attempt counts are taken from the adapter's report as-is.
    pub fn after_nack(
        queue: &str,
        job_id: &JobId,
        outcome: &NackOutcome,
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
    ) -> Self {
        if outcome.will_retry {
            QueueEvent::JobRetrying {
                queue: queue.to_string(),
                job_id: job_id.clone(),
                attempts: outcome.attempts,
                max_attempts: outcome.max_attempts,
                error,
                will_retry: true,
                retry_at: outcome.retry_at,
                timestamp,
            }
        } else {
            QueueEvent::JobFailed {
                queue: queue.to_string(),
                job_id: job_id.clone(),
                attempts: outcome.attempts,
                max_attempts: outcome.max_attempts,
                error,
                will_retry: false,
                timestamp,
            }
        }
    }

    pub fn queue_error(
        queue: &str,
        error: ErrorInfo,
        source_event: Option<QueueEventKind>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        QueueEvent::QueueError {
            queue: queue.to_string(),
            error,
            source_event,
            timestamp,
        }
    }

    pub fn kind(&self) -> QueueEventKind {
        match self {
            QueueEvent::JobActive { .. } => QueueEventKind::Active,
            QueueEvent::JobCompleted { .. } => QueueEventKind::Completed,
            QueueEvent::JobFailed { .. } => QueueEventKind::Failed,
            QueueEvent::JobRetrying { .. } => QueueEventKind::JobRetrying,
            QueueEvent::ProcessorShuttingDown { .. } => QueueEventKind::ProcessorShuttingDown,
            QueueEvent::ProcessorShutdownTimeout { .. } => {
                QueueEventKind::ProcessorShutdownTimeout
            }
            QueueEvent::QueueError { .. } => QueueEventKind::QueueError,
            QueueEvent::QueueDrained { .. } => QueueEventKind::QueueDrained,
            QueueEvent::QueuePaused { .. } => QueueEventKind::QueuePaused,
            QueueEvent::QueueResumed { .. } => QueueEventKind::QueueResumed,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::JobActive { queue, .. }
            | QueueEvent::JobCompleted { queue, .. }
            | QueueEvent::JobFailed { queue, .. }
            | QueueEvent::JobRetrying { queue, .. }
            | QueueEvent::ProcessorShuttingDown { queue, .. }
            | QueueEvent::ProcessorShutdownTimeout { queue, .. }
            | QueueEvent::QueueError { queue, .. }
            | QueueEvent::QueueDrained { queue, .. }
            | QueueEvent::QueuePaused { queue, .. }
            | QueueEvent::QueueResumed { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueueEvent::JobActive { job_id, .. }
            | QueueEvent::JobCompleted { job_id, .. }
            | QueueEvent::JobFailed { job_id, .. }
            | QueueEvent::JobRetrying { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QueueEvent::JobActive { timestamp, .. }
            | QueueEvent::JobCompleted { timestamp, .. }
            | QueueEvent::JobFailed { timestamp, .. }
            | QueueEvent::JobRetrying { timestamp, .. }
            | QueueEvent::ProcessorShuttingDown { timestamp, .. }
            | QueueEvent::ProcessorShutdownTimeout { timestamp, .. }
            | QueueEvent::QueueError { timestamp, .. }
            | QueueEvent::QueueDrained { timestamp, .. }
            | QueueEvent::QueuePaused { timestamp, .. }
            | QueueEvent::QueueResumed { timestamp, .. } => *timestamp,
        }
    }

    /// Short description for logging.
    pub fn description(&self) -> String {
        match self {
            QueueEvent::JobActive {
                job_id, attempts, ..
            } => format!("Job {job_id} active (attempt {attempts})"),
            QueueEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => match duration_ms {
                Some(ms) => format!("Job {job_id} completed in {ms}ms"),
                None => format!("Job {job_id} completed"),
            },
            QueueEvent::JobFailed { job_id, error, .. } => {
                format!("Job {job_id} failed: {error}")
            }
            QueueEvent::JobRetrying {
                job_id,
                attempts,
                max_attempts,
                ..
            } => format!("Job {job_id} retrying ({attempts}/{max_attempts})"),
            QueueEvent::ProcessorShuttingDown {
                queue, in_flight, ..
            } => format!("Processor for '{queue}' shutting down ({in_flight} in flight)"),
            QueueEvent::ProcessorShutdownTimeout {
                queue, abandoned, ..
            } => format!("Processor for '{queue}' timed out, {abandoned} abandoned"),
            QueueEvent::QueueError { queue, error, .. } => format!("Queue '{queue}' error: {error}"),
            QueueEvent::QueueDrained { queue, .. } => format!("Queue '{queue}' drained"),
            QueueEvent::QueuePaused { queue, .. } => format!("Queue '{queue}' paused"),
            QueueEvent::QueueResumed { queue, .. } => format!("Queue '{queue}' resumed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{QueueError, RuntimeCode};

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn wire_names_are_dotted() {
        let event = QueueEvent::QueueDrained {
            queue: "mail".into(),
            timestamp: ts(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "queue.drained");
        assert_eq!(event.kind().as_str(), "queue.drained");
    }

    #[test]
    fn every_kind_name_matches_serde() {
        for kind in QueueEventKind::ALL {
            let v = serde_json::to_value(kind).unwrap();
            assert_eq!(v, kind.as_str());
        }
    }

    #[test]
    fn after_nack_picks_event_by_will_retry() {
        let err = QueueError::runtime(RuntimeCode::Timeout, true, "slow").info();
        let id = JobId::new("7");

        let retry = NackOutcome {
            will_retry: true,
            attempts: 1,
            max_attempts: 3,
            retry_at: None,
        };
        let retrying = QueueEvent::after_nack("q", &id, &retry, err.clone(), ts());
        assert_eq!(retrying.kind(), QueueEventKind::JobRetrying);

        let give_up = NackOutcome {
            will_retry: false,
            attempts: 3,
            max_attempts: 3,
            retry_at: None,
        };
        let failed = QueueEvent::after_nack("q", &id, &give_up, err, ts());
        assert_eq!(failed.kind(), QueueEventKind::Failed);
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["willRetry"], false);
        assert_eq!(v["maxAttempts"], 3);
        assert_eq!(failed.job_id(), Some(&id));
    }
}
