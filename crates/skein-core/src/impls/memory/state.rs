//! In-memory queue state.
//!
//! Everything here is synchronous; the provider holds the state behind one
//! tokio `Mutex`, so each method is one atomic step.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use super::error::MemoryBackendError;
use super::record::JobRecord;
use super::retry::RetryPolicy;
use crate::domain::{
    ActiveJob, InstanceId, Job, JobFailure, JobId, JobStatus, LeaseId, LeaseToken, NackOutcome,
    NewJob, ProviderCapabilities, QueueStats, Retention,
};

type BackendResult<T> = std::result::Result<T, MemoryBackendError>;

/// Ready entry: highest priority first, then lowest order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    order: i64,
    job_id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Scheduled entry for delayed jobs.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    ready_at: Instant,
    seq: u64,
    job_id: JobId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time as seen by the state: wall clock for job fields, monotonic for
/// scheduling.
#[derive(Debug, Clone, Copy)]
pub(super) struct Now {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

#[derive(Debug)]
pub(super) struct MemoryState {
    queue: String,
    instance: InstanceId,
    capabilities: ProviderCapabilities,
    retry_policy: RetryPolicy,

    connected: bool,
    deleted: bool,
    paused: bool,

    /// All job records (single source of truth).
    jobs: HashMap<JobId, JobRecord>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    leases: HashMap<LeaseId, JobId>,

    /// Terminal jobs in completion order, for `KeepLast` retention.
    completed_order: VecDeque<JobId>,
    failed_order: VecDeque<JobId>,
    dead_letters: VecDeque<JobId>,

    next_seq: u64,
    completed_total: u64,
    failed_total: u64,
}

impl MemoryState {
    pub fn new(
        queue: String,
        instance: InstanceId,
        capabilities: ProviderCapabilities,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            instance,
            capabilities,
            retry_policy,
            connected: false,
            deleted: false,
            paused: false,
            jobs: HashMap::new(),
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            leases: HashMap::new(),
            completed_order: VecDeque::new(),
            failed_order: VecDeque::new(),
            dead_letters: VecDeque::new(),
            next_seq: 0,
            completed_total: 0,
            failed_total: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.deleted
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn ensure_usable(&self) -> BackendResult<()> {
        if self.deleted {
            return Err(MemoryBackendError::QueueDeleted(self.queue.clone()));
        }
        if !self.connected {
            return Err(MemoryBackendError::NotConnected(self.queue.clone()));
        }
        Ok(())
    }

    pub fn connect(&mut self) -> BackendResult<()> {
        if self.deleted {
            return Err(MemoryBackendError::QueueDeleted(self.queue.clone()));
        }
        self.connected = true;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn set_paused(&mut self, paused: bool) -> BackendResult<()> {
        self.ensure_usable()?;
        self.paused = paused;
        Ok(())
    }

    /// Drop everything. The instance stays unusable afterwards.
    pub fn delete(&mut self) -> BackendResult<()> {
        self.ensure_usable()?;
        self.jobs.clear();
        self.ready.clear();
        self.delayed.clear();
        self.leases.clear();
        self.completed_order.clear();
        self.failed_order.clear();
        self.dead_letters.clear();
        self.deleted = true;
        self.connected = false;
        Ok(())
    }

    pub fn insert(&mut self, new_job: NewJob, now: Now) -> BackendResult<Job<Value>> {
        self.ensure_usable()?;
        if self.jobs.contains_key(&new_job.options.job_id) {
            return Err(MemoryBackendError::DuplicateJob(new_job.options.job_id));
        }

        let delay = new_job.options.delay;
        let seq = self.next_seq();
        let record = JobRecord::new(&self.queue, new_job, seq, now.wall);
        let view = record.view();

        if record.status() == JobStatus::Delayed {
            self.delayed.push(DelayedEntry {
                ready_at: now.mono + delay,
                seq,
                job_id: record.job.id.clone(),
            });
        } else {
            self.push_ready(&record);
        }
        self.jobs.insert(record.job.id.clone(), record);
        Ok(view)
    }

    /// Test hook: store `value` as-is, bypassing the envelope.
    #[cfg(test)]
    pub fn insert_raw(&mut self, id: JobId, name: &str, value: Value, now: Now) {
        let seq = self.next_seq();
        let mut record = JobRecord::new(
            &self.queue,
            NewJob {
                name: name.to_string(),
                data: Value::Null,
                options: crate::domain::NormalizedOptions {
                    job_id: id.clone(),
                    attempts: 1,
                    delay: std::time::Duration::ZERO,
                    priority: None,
                    remove_on_complete: Retention::Keep,
                    remove_on_fail: Retention::Keep,
                    lifo: false,
                    metadata: Default::default(),
                },
            },
            seq,
            now.wall,
        );
        record.job.data = value;
        self.push_ready(&record);
        self.jobs.insert(id, record);
    }

    fn push_ready(&mut self, record: &JobRecord) {
        self.ready.push(ReadyEntry {
            priority: record.priority(),
            order: record.order(),
            job_id: record.job.id.clone(),
        });
    }

    pub fn get(&self, id: &JobId) -> BackendResult<Option<Job<Value>>> {
        self.ensure_usable()?;
        Ok(self.jobs.get(id).map(JobRecord::view))
    }

    /// Move due delayed jobs to the ready heap.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            let Some(record) = self.jobs.get_mut(&entry.job_id) else {
                continue;
            };
            if record.status() != JobStatus::Delayed || record.seq != entry.seq {
                continue;
            }
            record.job.status = JobStatus::Waiting;
            let record = record.clone();
            self.push_ready(&record);
        }
    }

    /// When the earliest delayed job becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|e| e.ready_at)
    }

    /// Lease up to `count` ready jobs. Empty while paused.
    pub fn checkout(&mut self, count: usize, now: Now) -> BackendResult<Vec<ActiveJob>> {
        self.ensure_usable()?;
        if self.paused || count == 0 {
            return Ok(Vec::new());
        }
        self.promote_due(now.mono);

        let mut out = Vec::with_capacity(count.min(self.ready.len()));
        while out.len() < count {
            let Some(entry) = self.ready.pop() else {
                break;
            };
            let Some(record) = self.jobs.get_mut(&entry.job_id) else {
                continue;
            };
            // Stale entry (retried, revived or removed since it was pushed).
            if record.status() != JobStatus::Waiting || record.order() != entry.order {
                continue;
            }
            let token = LeaseToken::issue(entry.job_id.clone(), self.instance);
            record.start_attempt(token.lease_id(), now.wall);
            self.leases.insert(token.lease_id(), entry.job_id);
            out.push(ActiveJob::new(record.view(), token));
        }
        Ok(out)
    }

    /// Consume a lease. Tokens from other instances are never ours.
    fn take_lease(&mut self, token: &LeaseToken) -> BackendResult<JobId> {
        let unknown = || MemoryBackendError::UnknownLease(token.to_string());
        if token.issuer() != self.instance {
            return Err(unknown());
        }
        let owner = self.leases.get(&token.lease_id()).ok_or_else(unknown)?;
        if owner != token.job_id() {
            return Err(unknown());
        }
        let leased = self
            .jobs
            .get(owner)
            .is_some_and(|r| r.lease == Some(token.lease_id()));
        if !leased {
            return Err(unknown());
        }
        self.leases.remove(&token.lease_id()).ok_or_else(unknown)
    }

    /// Active → Completed. Returns the job as it was before retention ran.
    pub fn complete(
        &mut self,
        token: &LeaseToken,
        result: Option<Value>,
        now: Now,
    ) -> BackendResult<Job<Value>> {
        self.ensure_usable()?;
        let id = self.take_lease(token)?;
        let record = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MemoryBackendError::UnknownJob(id.clone()))?;
        record.mark_completed(result, now.wall);
        let retention = record.remove_on_complete;
        let view = record.view();

        self.completed_total += 1;
        self.retain(JobStatus::Completed, id, retention);
        Ok(view)
    }

    /// Active → retry or terminal failure.
    ///
    /// `retryable` is the mapper's verdict on `failure`; a failure it does
    /// not consider retryable goes straight to the terminal branch.
    pub fn fail(
        &mut self,
        token: &LeaseToken,
        failure: &JobFailure,
        retryable: bool,
        now: Now,
    ) -> BackendResult<NackOutcome> {
        self.ensure_usable()?;
        let id = self.take_lease(token)?;
        let caps = self.capabilities.clone();
        let seq = self.next_seq();
        let record = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MemoryBackendError::UnknownJob(id.clone()))?;

        let attempts = record.job.attempts;
        let max_attempts = record.job.max_attempts;
        let will_retry = caps.supports_retries
            && retryable
            && !failure.is_permanent()
            && attempts < max_attempts;

        if will_retry {
            let delay = if caps.supports_delayed_jobs {
                self.retry_policy.next_delay(attempts)
            } else {
                std::time::Duration::ZERO
            };
            let retry_at = if delay.is_zero() {
                None
            } else {
                chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.wall.checked_add_signed(d))
            };
            record.schedule_retry(failure.message(), retry_at, seq);
            let record = record.clone();
            if retry_at.is_some() {
                self.delayed.push(DelayedEntry {
                    ready_at: now.mono + delay,
                    seq,
                    job_id: id,
                });
            } else {
                self.push_ready(&record);
            }
            return Ok(NackOutcome {
                will_retry: true,
                attempts,
                max_attempts,
                retry_at: retry_at.or(Some(now.wall)),
            });
        }

        record.mark_failed(failure.message(), now.wall);
        let retention = record.remove_on_fail;
        self.failed_total += 1;
        if caps.supports_dlq && retention != Retention::Remove {
            self.dead_letters.push_back(id.clone());
        }
        self.retain(JobStatus::Failed, id, retention);
        Ok(NackOutcome {
            will_retry: false,
            attempts,
            max_attempts,
            retry_at: None,
        })
    }

    /// Give abandoned leases back without consuming the attempt.
    pub fn release(&mut self, token: &LeaseToken) -> BackendResult<()> {
        let id = self.take_lease(token)?;
        let seq = self.next_seq();
        let record = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MemoryBackendError::UnknownJob(id.clone()))?;
        record.release(seq);
        let record = record.clone();
        self.push_ready(&record);
        Ok(())
    }

    /// Apply a terminal retention policy to `id`.
    fn retain(&mut self, status: JobStatus, id: JobId, retention: Retention) {
        if retention == Retention::Remove {
            self.jobs.remove(&id);
            return;
        }
        let order = match status {
            JobStatus::Completed => &mut self.completed_order,
            _ => &mut self.failed_order,
        };
        order.push_back(id);
        let Retention::KeepLast(keep) = retention else {
            return;
        };
        let mut evicted = Vec::new();
        while order.len() > keep {
            if let Some(old) = order.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            if self.jobs.get(&old).is_some_and(|r| r.status() == status) {
                self.jobs.remove(&old);
                self.dead_letters.retain(|d| d != &old);
            }
        }
    }

    pub fn dead_letters(&self, limit: usize) -> BackendResult<Vec<Job<Value>>> {
        self.ensure_usable()?;
        Ok(self
            .dead_letters
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .take(limit)
            .map(JobRecord::view)
            .collect())
    }

    /// Failed → Waiting with attempts reset.
    pub fn revive(&mut self, id: &JobId) -> BackendResult<()> {
        self.ensure_usable()?;
        let failed = self
            .jobs
            .get(id)
            .is_some_and(|r| r.status() == JobStatus::Failed);
        if !failed {
            return Err(MemoryBackendError::UnknownJob(id.clone()));
        }
        let seq = self.next_seq();
        self.dead_letters.retain(|d| d != id);
        self.failed_order.retain(|d| d != id);
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| MemoryBackendError::UnknownJob(id.clone()))?;
        record.revive(seq);
        let record = record.clone();
        self.push_ready(&record);
        Ok(())
    }

    pub fn stats(&self) -> BackendResult<QueueStats> {
        self.ensure_usable()?;
        let mut stats = QueueStats {
            paused: self.paused,
            dead_lettered: self.dead_letters.len() as u64,
            ..QueueStats::default()
        };
        for record in self.jobs.values() {
            match record.status() {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    pub fn waiting(&self) -> u64 {
        self.jobs
            .values()
            .filter(|r| r.status() == JobStatus::Waiting)
            .count() as u64
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.completed_total, self.failed_total)
    }
}
