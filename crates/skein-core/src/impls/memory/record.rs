//! JobRecord - 保存されたジョブの状態遷移

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{
    Job, JobStatus, LeaseId, Metadata, NewJob, PayloadEnvelope, Retention,
};

/// One stored job.
///
/// `job.data` holds the wrapped envelope, never the caller's raw payload.
#[derive(Debug, Clone)]
pub(super) struct JobRecord {
    pub job: Job<Value>,
    pub seq: u64,
    pub lifo: bool,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    pub lease: Option<LeaseId>,
}

impl JobRecord {
    pub fn new(queue: &str, new_job: NewJob, seq: u64, now: DateTime<Utc>) -> Self {
        let NewJob {
            name,
            data,
            options,
        } = new_job;
        let scheduled_for = options.scheduled_for(now);
        let status = if scheduled_for.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        let stored = PayloadEnvelope::new(name.clone(), data, options.metadata).wrap();

        Self {
            job: Job {
                id: options.job_id,
                name,
                queue_name: queue.to_string(),
                data: stored,
                status,
                attempts: 0,
                max_attempts: options.attempts,
                priority: options.priority,
                scheduled_for,
                created_at: Some(now),
                processed_at: None,
                completed_at: None,
                failed_at: None,
                failed_reason: None,
                return_value: None,
                metadata: Metadata::new(),
            },
            seq,
            lifo: options.lifo,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            lease: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn priority(&self) -> i32 {
        self.job.priority.unwrap_or(0)
    }

    /// Heap order within one priority level.
    pub fn order(&self) -> i64 {
        let seq = self.seq.min(i64::MAX as u64) as i64;
        if self.lifo { -seq } else { seq }
    }

    /// The caller-facing view: envelope unwrapped, metadata restored.
    pub fn view(&self) -> Job<Value> {
        let (name, data, metadata) = PayloadEnvelope::unwrap(self.job.data.clone());
        let mut job = self.job.clone();
        job.data = data;
        job.metadata = metadata;
        if let Some(name) = name {
            job.name = name;
        }
        job
    }

    /// Waiting/Delayed → Active
    pub fn start_attempt(&mut self, lease: LeaseId, now: DateTime<Utc>) {
        self.job.status = JobStatus::Active;
        self.job.attempts += 1;
        self.job.processed_at.get_or_insert(now);
        self.lease = Some(lease);
    }

    /// Active → Completed
    pub fn mark_completed(&mut self, result: Option<Value>, now: DateTime<Utc>) {
        self.job.status = JobStatus::Completed;
        self.job.completed_at = Some(now);
        self.job.return_value = result;
        self.lease = None;
    }

    /// Active → Waiting or Delayed
    pub fn schedule_retry(&mut self, reason: &str, retry_at: Option<DateTime<Utc>>, seq: u64) {
        self.job.status = if retry_at.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        self.job.scheduled_for = retry_at;
        self.job.failed_reason = Some(reason.to_string());
        self.seq = seq;
        self.lease = None;
    }

    /// Active → Failed
    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) {
        self.job.status = JobStatus::Failed;
        self.job.failed_at = Some(now);
        self.job.failed_reason = Some(reason.to_string());
        self.lease = None;
    }

    /// Failed → Waiting, attempts reset.
    pub fn revive(&mut self, seq: u64) {
        self.job.status = JobStatus::Waiting;
        self.job.attempts = 0;
        self.job.scheduled_for = None;
        self.job.failed_at = None;
        self.job.failed_reason = None;
        self.seq = seq;
    }

    /// Active → Waiting without consuming the attempt (abandoned lease).
    pub fn release(&mut self, seq: u64) {
        self.job.status = JobStatus::Waiting;
        self.job.attempts = self.job.attempts.saturating_sub(1);
        self.seq = seq;
        self.lease = None;
    }
}
