//! QueueProvider port - バックエンドアダプタの契約
//!
//! Every backend adapter implements this trait. It is the seam between the
//! client lifecycle (`Queue`, `Worker`) and a concrete engine.
//!
//! # 契約
//! - All operations return `Result<_, QueueError>`; backend failures are
//!   classified by an `ErrorMapper` before they leave the adapter.
//! - `fetch` is atomic per job: no id is handed out twice while leased.
//! - `ack`/`nack` consume the lease token; reuse is `QueueError::NotFound`.
//! - `nack` decides retry vs. dead-letter; the caller only republishes the
//!   returned `NackOutcome`.
//! - Payloads are opaque JSON. The adapter wraps them so backend-native
//!   fields never mix with user data, and unwraps defensively.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{EventSink, JobHandler};
use crate::domain::{
    ActiveJob, HealthStatus, Job, JobDefaults, JobFailure, JobId, LeaseToken, NackOutcome, NewJob,
    ProviderCapabilities, QueueError, QueueStats, Result,
};

/// Called with the classified error of every failed push-mode job.
pub type ErrorCallback = Arc<dyn Fn(&QueueError) + Send + Sync>;

/// Push-mode pool settings.
#[derive(Clone)]
pub struct ProcessOptions {
    /// Maximum handler invocations in flight. At least 1.
    pub concurrency: usize,
    /// Drain budget used by `shutdown(None)`.
    pub shutdown_timeout: Duration,
    pub on_error: Option<ErrorCallback>,
}

impl ProcessOptions {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
            on_error: None,
        }
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&QueueError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueueError::invalid_option("concurrency must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("concurrency", &self.concurrency)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// How a processor shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight handler finished.
    Drained,
    /// The timeout hit; `abandoned` handlers were torn down.
    TimedOut { abandoned: usize },
}

/// Handle of a running push-mode pool.
#[async_trait]
pub trait ProcessorHandle: Send + Sync {
    /// Stop intake, drain in-flight handlers, release workers.
    ///
    /// Idempotent: later calls return the first call's outcome. Resolves
    /// after at most `timeout` (or the pool's configured timeout), emitting
    /// `processor.shutdown_timeout` when the drain did not finish.
    async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownOutcome;

    fn is_running(&self) -> bool;

    /// Handlers currently executing.
    fn in_flight(&self) -> usize;
}

#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// The queue this adapter instance serves.
    fn queue_name(&self) -> &str;

    /// Fixed for the lifetime of the instance.
    fn capabilities(&self) -> &ProviderCapabilities;

    /// Adapter-level defaults, merged under queue and per-call options.
    fn default_job_options(&self) -> JobDefaults {
        JobDefaults::default()
    }

    /// Acquire backend resources. No-op when already connected.
    async fn connect(&self) -> Result<()>;

    /// Release backend resources. No-op when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    async fn add(&self, job: NewJob) -> Result<Job>;

    /// Gated by `supports_batching`; the default adds one by one.
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>> {
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            added.push(self.add(job).await?);
        }
        Ok(added)
    }

    /// `Ok(None)` when the id is unknown.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Pause backend intake and every local processor of this adapter.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Destroy the queue and everything in it. Not reversible.
    async fn delete(&self) -> Result<()>;

    async fn get_stats(&self) -> Result<QueueStats>;

    async fn get_health(&self) -> Result<HealthStatus>;

    /// Check out up to `count` ready jobs.
    async fn fetch(&self, count: usize) -> Result<Vec<ActiveJob>>;

    async fn ack(&self, token: &LeaseToken, result: Option<Value>) -> Result<()>;

    async fn nack(&self, token: &LeaseToken, failure: &JobFailure) -> Result<NackOutcome>;

    /// Hand a checked-out job back to the ready set without spending the
    /// attempt. The lease is consumed like `ack`/`nack`.
    async fn release(&self, token: &LeaseToken) -> Result<()>;

    /// Start a bounded push-mode pool. Lifecycle events go to `events`.
    async fn process(
        &self,
        handler: Arc<dyn JobHandler>,
        options: ProcessOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn ProcessorHandle>>;

    /// Requires `supports_dlq`.
    async fn get_dlq_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let _ = limit;
        Err(QueueError::unsupported("dead-letter queue"))
    }

    /// Move a dead-lettered job back to waiting. Requires `supports_retries`.
    async fn retry_job(&self, id: &JobId) -> Result<()> {
        let _ = id;
        Err(QueueError::unsupported("manual retry"))
    }
}
