//! In-memory adapter - プロセス内で完結する QueueProvider
//!
//! Reference backend: every optional capability can be switched on or off
//! through [`MemoryProviderConfig`], which makes it the adapter the contract
//! tests run against.
//!
//! # 設計原則
//! - State lives behind one tokio `Mutex`; no lock is held across a handler.
//! - Delayed jobs sit in a min-heap keyed on tokio `Instant` and are promoted
//!   on checkout, so paused test time drives them.
//! - Waiting workers sleep on a `Notify` and wake on add, resume and retry.

mod error;
mod processor;
mod record;
mod retry;
mod state;

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;

pub use error::MemoryBackendError;
pub use retry::RetryPolicy;

use self::error::memory_error_mapper;
use self::processor::MemoryProcessor;
use self::state::{MemoryState, Now};
use crate::config::MemoryProviderConfig;
use crate::domain::{
    ActiveJob, ErrorMapper, HealthStatus, InstanceId, Job, JobDefaults, JobFailure, JobId,
    LeaseToken, NackOutcome, NewJob, ProviderCapabilities, QueueError, QueueStats, Result,
};
use crate::ports::{
    Clock, EventSink, JobHandler, ProcessOptions, ProcessorHandle, QueueProvider, SystemClock,
};

/// Everything the provider and its pools share.
struct Shared {
    queue: String,
    config: MemoryProviderConfig,
    state: Mutex<MemoryState>,
    notify: Notify,
    /// Local pause flag watched by pool workers.
    paused: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    mapper: ErrorMapper,
    backend_calls: AtomicUsize,
    active_workers: AtomicUsize,
    last_error: StdMutex<Option<String>>,
}

impl Shared {
    fn now(&self) -> Now {
        Now {
            wall: self.clock.now(),
            mono: Instant::now(),
        }
    }

    fn touch(&self) {
        self.backend_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Classify a native error and remember it for health reports.
    fn classify(&self, err: MemoryBackendError) -> QueueError {
        let mapped = self.mapper.map(err);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(mapped.to_string());
        }
        mapped
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }

    async fn checkout(&self, count: usize) -> Result<Vec<ActiveJob>> {
        let now = self.now();
        let mut state = self.state.lock().await;
        state.checkout(count, now).map_err(|e| self.classify(e))
    }

    async fn complete(&self, token: &LeaseToken, result: Option<Value>) -> Result<Job> {
        let now = self.now();
        let mut state = self.state.lock().await;
        state.complete(token, result, now).map_err(|e| self.classify(e))
    }

    /// Unclassified and non-retryable failures are never retried.
    async fn fail(&self, token: &LeaseToken, failure: &JobFailure) -> Result<NackOutcome> {
        let retryable = self.mapper.map_failure(failure).is_retryable();
        let now = self.now();
        let outcome = {
            let mut state = self.state.lock().await;
            state
                .fail(token, failure, retryable, now)
                .map_err(|e| self.classify(e))?
        };
        if outcome.will_retry {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        self.state
            .lock()
            .await
            .release(token)
            .map_err(|e| self.classify(e))?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return an abandoned lease to the ready set; a lease the handler
    /// finalized in the meantime is left alone.
    async fn release_abandoned(&self, token: &LeaseToken) {
        let released = self.state.lock().await.release(token);
        match released {
            Ok(()) => {
                tracing::debug!(queue = %self.queue, job_id = %token.job_id(), "abandoned lease released");
                self.notify.notify_waiters();
            }
            Err(err) => {
                tracing::debug!(queue = %self.queue, lease = %token, error = %err, "lease already finalized");
            }
        }
    }

    /// Waiting count, `None` when the backend is unusable.
    async fn waiting(&self) -> Option<u64> {
        let state = self.state.lock().await;
        state.ensure_usable().ok().map(|()| state.waiting())
    }

    /// Sleep until new work, the next delayed job, or the poll interval.
    async fn idle(&self, notified: Pin<&mut Notified<'_>>) {
        let due = self.state.lock().await.next_due();
        let poll = Instant::now() + self.config.poll_interval;
        let wake = due.map_or(poll, |due| due.min(poll));
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// In-memory queue implementation.
pub struct InMemoryProvider {
    shared: Arc<Shared>,
}

impl InMemoryProvider {
    pub fn new(queue_name: impl Into<String>, config: MemoryProviderConfig) -> Self {
        Self::with_clock(queue_name, config, Arc::new(SystemClock))
    }

    /// Wall-clock timestamps come from `clock`; scheduling uses tokio time.
    pub fn with_clock(
        queue_name: impl Into<String>,
        config: MemoryProviderConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = queue_name.into();
        let state = MemoryState::new(
            queue.clone(),
            InstanceId::new(),
            config.capabilities.clone(),
            config.retry.clone(),
        );
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                queue,
                config,
                state: Mutex::new(state),
                notify: Notify::new(),
                paused,
                clock,
                mapper: memory_error_mapper(),
                backend_calls: AtomicUsize::new(0),
                active_workers: AtomicUsize::new(0),
                last_error: StdMutex::new(None),
            }),
        }
    }

    /// Contract calls that reached this adapter.
    pub fn backend_calls(&self) -> usize {
        self.shared.backend_calls.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MemoryProviderConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, id: &str, name: &str, value: Value) {
        let now = self.shared.now();
        self.shared
            .state
            .lock()
            .await
            .insert_raw(JobId::new(id), name, value, now);
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("queue", &self.shared.queue)
            .field("capabilities", &self.shared.config.capabilities)
            .finish()
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    fn queue_name(&self) -> &str {
        &self.shared.queue
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.shared.config.capabilities
    }

    fn default_job_options(&self) -> JobDefaults {
        self.shared.config.defaults.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.shared.touch();
        let mut state = self.shared.state.lock().await;
        if state.is_connected() {
            return Ok(());
        }
        state.connect().map_err(|e| self.shared.classify(e))?;
        tracing::info!(queue = %self.shared.queue, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.touch();
        let mut state = self.shared.state.lock().await;
        if state.is_connected() {
            state.disconnect();
            tracing::info!(queue = %self.shared.queue, "disconnected");
        }
        Ok(())
    }

    async fn add(&self, job: NewJob) -> Result<Job> {
        self.shared.touch();
        let now = self.shared.now();
        let added = {
            let mut state = self.shared.state.lock().await;
            state.insert(job, now).map_err(|e| self.shared.classify(e))?
        };
        // Notify outside the lock
        self.shared.notify.notify_waiters();
        tracing::debug!(queue = %self.shared.queue, job_id = %added.id, "job added");
        Ok(added)
    }

    /// All or nothing: duplicates inside the batch or against stored jobs
    /// reject the whole batch.
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>> {
        self.shared.touch();
        if !self.shared.config.capabilities.supports_batching {
            return Err(QueueError::unsupported("batch add"));
        }
        let now = self.shared.now();
        let added = {
            let mut state = self.shared.state.lock().await;
            state.ensure_usable().map_err(|e| self.shared.classify(e))?;
            let mut seen = std::collections::HashSet::new();
            for job in &jobs {
                let id = &job.options.job_id;
                if !seen.insert(id.clone()) || state.get(id).ok().flatten().is_some() {
                    return Err(self
                        .shared
                        .classify(MemoryBackendError::DuplicateJob(id.clone())));
                }
            }
            let mut added = Vec::with_capacity(jobs.len());
            for job in jobs {
                added.push(state.insert(job, now).map_err(|e| self.shared.classify(e))?);
            }
            added
        };
        self.shared.notify.notify_waiters();
        tracing::debug!(queue = %self.shared.queue, count = added.len(), "jobs added");
        Ok(added)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.shared.touch();
        let state = self.shared.state.lock().await;
        state.get(id).map_err(|e| self.shared.classify(e))
    }

    async fn pause(&self) -> Result<()> {
        self.shared.touch();
        self.shared
            .state
            .lock()
            .await
            .set_paused(true)
            .map_err(|e| self.shared.classify(e))?;
        self.shared.paused.send_replace(true);
        tracing::info!(queue = %self.shared.queue, "paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.shared.touch();
        self.shared
            .state
            .lock()
            .await
            .set_paused(false)
            .map_err(|e| self.shared.classify(e))?;
        self.shared.paused.send_replace(false);
        self.shared.notify.notify_waiters();
        tracing::info!(queue = %self.shared.queue, "resumed");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.shared.touch();
        self.shared
            .state
            .lock()
            .await
            .delete()
            .map_err(|e| self.shared.classify(e))?;
        self.shared.notify.notify_waiters();
        tracing::info!(queue = %self.shared.queue, "queue deleted");
        Ok(())
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        self.shared.touch();
        let state = self.shared.state.lock().await;
        state.stats().map_err(|e| self.shared.classify(e))
    }

    /// Never fails: an unusable backend reports `healthy: false`.
    async fn get_health(&self) -> Result<HealthStatus> {
        self.shared.touch();
        let state = self.shared.state.lock().await;
        let (completed, failed) = state.totals();
        let connected = state.is_connected();
        Ok(HealthStatus {
            healthy: connected,
            connected,
            paused: state.is_paused(),
            error_rate: HealthStatus::error_rate_of(completed, failed),
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
            waiting: state.waiting(),
            last_error: self.shared.last_error(),
            checked_at: self.shared.clock.now(),
        })
    }

    /// With `supports_long_polling`, waits up to the configured timeout for
    /// the first job instead of returning empty right away.
    async fn fetch(&self, count: usize) -> Result<Vec<ActiveJob>> {
        self.shared.touch();
        let deadline = self
            .shared
            .config
            .capabilities
            .supports_long_polling
            .then(|| Instant::now() + self.shared.config.long_poll_timeout);

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let jobs = self.shared.checkout(count).await?;
            let Some(deadline) = deadline else {
                return Ok(jobs);
            };
            if !jobs.is_empty() || Instant::now() >= deadline {
                return Ok(jobs);
            }
            let due = self.shared.state.lock().await.next_due();
            let wake = due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, token: &LeaseToken, result: Option<Value>) -> Result<()> {
        self.shared.touch();
        self.shared.complete(token, result).await.map(|_| ())
    }

    async fn nack(&self, token: &LeaseToken, failure: &JobFailure) -> Result<NackOutcome> {
        self.shared.touch();
        self.shared.fail(token, failure).await
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        self.shared.touch();
        self.shared.release(token).await
    }

    async fn process(
        &self,
        handler: Arc<dyn JobHandler>,
        options: ProcessOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn ProcessorHandle>> {
        self.shared.touch();
        options.validate()?;
        self.shared
            .state
            .lock()
            .await
            .ensure_usable()
            .map_err(|e| self.shared.classify(e))?;
        Ok(Arc::new(MemoryProcessor::spawn(
            Arc::clone(&self.shared),
            handler,
            options,
            events,
        )))
    }

    async fn get_dlq_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.shared.touch();
        if !self.shared.config.capabilities.supports_dlq {
            return Err(QueueError::unsupported("dead-letter queue"));
        }
        let state = self.shared.state.lock().await;
        state.dead_letters(limit).map_err(|e| self.shared.classify(e))
    }

    async fn retry_job(&self, id: &JobId) -> Result<()> {
        self.shared.touch();
        if !self.shared.config.capabilities.supports_retries {
            return Err(QueueError::unsupported("manual retry"));
        }
        self.shared
            .state
            .lock()
            .await
            .revive(id)
            .map_err(|e| self.shared.classify(e))?;
        self.shared.notify.notify_waiters();
        tracing::info!(queue = %self.shared.queue, job_id = %id, "job moved back to waiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ErrorKind, JobStatus, NormalizedOptions, QueueEvent, QueueEventKind, Retention,
        RuntimeCode,
    };
    use crate::ports::{EmitError, ShutdownOutcome};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Collects every event it is handed.
    #[derive(Default)]
    struct Recorder(StdMutex<Vec<QueueEvent>>);

    impl Recorder {
        fn kinds(&self) -> Vec<QueueEventKind> {
            self.0
                .lock()
                .map(|events| events.iter().map(QueueEvent::kind).collect())
                .unwrap_or_default()
        }

        fn count(&self, kind: QueueEventKind) -> usize {
            self.kinds().into_iter().filter(|k| *k == kind).count()
        }
    }

    impl EventSink for Recorder {
        fn emit(&self, event: QueueEvent) -> std::result::Result<(), EmitError> {
            if let Ok(mut events) = self.0.lock() {
                events.push(event);
            }
            Ok(())
        }
    }

    fn config() -> MemoryProviderConfig {
        MemoryProviderConfig {
            retry: RetryPolicy::immediate(),
            poll_interval: Duration::from_millis(10),
            ..MemoryProviderConfig::default()
        }
    }

    async fn provider(config: MemoryProviderConfig) -> InMemoryProvider {
        let provider = InMemoryProvider::new("mem", config);
        provider.connect().await.unwrap();
        provider
    }

    fn new_job(id: &str, attempts: u32) -> NewJob {
        NewJob {
            name: "task".into(),
            data: json!({ "id": id }),
            options: NormalizedOptions {
                job_id: JobId::new(id),
                attempts,
                delay: Duration::ZERO,
                priority: None,
                remove_on_complete: Retention::Keep,
                remove_on_fail: Retention::Keep,
                lifo: false,
                metadata: Default::default(),
            },
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn foreign_payloads_are_returned_untouched() {
        let p = provider(config()).await;
        p.insert_raw("legacy", "import", json!({"plain": true})).await;

        let job = p.get_job(&JobId::new("legacy")).await.unwrap().unwrap();
        assert_eq!(job.data, json!({"plain": true}));
        assert_eq!(job.name, "import");
        assert!(job.metadata.is_empty());
    }

    #[tokio::test]
    async fn operations_before_connect_are_connection_errors() {
        let p = InMemoryProvider::new("mem", config());
        let err = p.add(new_job("a", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.code(), Some("CONNECTION"));
        assert!(err.is_retryable());

        let health = p.get_health().await.unwrap();
        assert!(!health.healthy);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let p = provider(config()).await;
        p.connect().await.unwrap();
        p.disconnect().await.unwrap();
        p.disconnect().await.unwrap();
        assert!(p.get_stats().await.is_err());
    }

    #[tokio::test]
    async fn duplicate_ids_are_data_errors() {
        let p = provider(config()).await;
        p.add(new_job("a", 1)).await.unwrap();
        let err = p.add(new_job("a", 1)).await.unwrap_err();
        assert_eq!(err.code(), Some("DUPLICATE"));
    }

    #[tokio::test]
    async fn bulk_add_is_all_or_nothing() {
        let p = provider(config()).await;
        p.add(new_job("b", 1)).await.unwrap();
        let err = p
            .add_bulk(vec![new_job("a", 1), new_job("b", 1)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("DUPLICATE"));
        assert!(p.get_job(&JobId::new("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_queues_report_queue_not_found() {
        let p = provider(config()).await;
        p.add(new_job("a", 1)).await.unwrap();
        p.delete().await.unwrap();
        let err = p.get_stats().await.unwrap_err();
        assert_eq!(err.code(), Some("QUEUE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn long_polling_waits_for_work() {
        let mut cfg = config();
        cfg.capabilities.supports_long_polling = true;
        cfg.long_poll_timeout = Duration::from_secs(2);
        let p = Arc::new(provider(cfg).await);

        let poller = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.fetch(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.add(new_job("late", 1)).await.unwrap();

        let jobs = poller.await.unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id().as_str(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn long_polling_gives_up_after_the_timeout() {
        let mut cfg = config();
        cfg.capabilities.supports_long_polling = true;
        cfg.long_poll_timeout = Duration::from_millis(300);
        let p = provider(cfg).await;

        let started = Instant::now();
        assert!(p.fetch(1).await.unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn pool_retries_until_attempts_run_out() {
        let p = provider(config()).await;
        p.add(new_job("flaky", 3)).await.unwrap();
        let events = Arc::new(Recorder::default());
        let failures = Arc::new(AtomicUsize::new(0));

        let handler: Arc<dyn JobHandler> = Arc::new(|_job: Job| async {
            Err::<Option<Value>, _>(JobFailure::new("connection refused by upstream"))
        });
        let seen = Arc::clone(&failures);
        let handle = p
            .process(
                handler,
                ProcessOptions::new(1).on_error(move |err| {
                    assert_eq!(err.code(), Some("CONNECTION"));
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
                events.clone(),
            )
            .await
            .unwrap();

        wait_until(|| events.count(QueueEventKind::Failed) == 1).await;
        assert_eq!(handle.shutdown(None).await, ShutdownOutcome::Drained);

        assert_eq!(events.count(QueueEventKind::JobRetrying), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        let job = p.get_job(&JobId::new("flaky")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(p.get_dlq_jobs(10).await.unwrap().len(), 1);
    }

    #[rstest]
    #[case::timeout(JobFailure::new("upstream timed out"), true)]
    #[case::connection(JobFailure::new("connection refused by upstream"), true)]
    #[case::typed(JobFailure::from(QueueError::runtime(RuntimeCode::RateLimit, true, "slow down")), true)]
    #[case::unknown(JobFailure::new("the flux capacitor misbehaved"), false)]
    #[case::lock(JobFailure::new("Missing lock for job 3"), false)]
    #[case::script(JobFailure::new("ERR Error running script"), false)]
    #[case::permanent(JobFailure::permanent("upstream timed out"), false)]
    #[tokio::test]
    async fn nack_retries_only_retryable_failures(
        #[case] failure: JobFailure,
        #[case] will_retry: bool,
    ) {
        let p = provider(config()).await;
        p.add(new_job("a", 3)).await.unwrap();
        let leased = p.fetch(1).await.unwrap().remove(0);

        let outcome = p.nack(leased.token(), &failure).await.unwrap();
        assert_eq!(outcome.will_retry, will_retry);
        let job = p.get_job(&JobId::new("a")).await.unwrap().unwrap();
        let expected = if will_retry { JobStatus::Waiting } else { JobStatus::Failed };
        assert_eq!(job.status, expected);
    }

    #[tokio::test]
    async fn released_leases_return_to_waiting() {
        let p = provider(config()).await;
        p.add(new_job("a", 3)).await.unwrap();
        let leased = p.fetch(1).await.unwrap().remove(0);

        p.release(leased.token()).await.unwrap();
        let job = p.get_job(&JobId::new("a")).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Waiting, 0));
        let err = p.release(leased.token()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn handler_panics_become_failures() {
        let p = provider(config()).await;
        p.add(new_job("boom", 1)).await.unwrap();
        let events = Arc::new(Recorder::default());

        let handler: Arc<dyn JobHandler> = Arc::new(|_job: Job| async {
            if true {
                panic!("kaboom");
            }
            Ok::<Option<Value>, JobFailure>(None)
        });
        let handle = p
            .process(handler, ProcessOptions::new(1), events.clone())
            .await
            .unwrap();

        wait_until(|| events.count(QueueEventKind::Failed) == 1).await;
        handle.shutdown(None).await;
        let job = p.get_job(&JobId::new("boom")).await.unwrap().unwrap();
        assert!(job.failed_reason.unwrap_or_default().contains("kaboom"));
    }

    #[tokio::test]
    async fn pool_emits_drained_once_per_burst() {
        let p = provider(config()).await;
        for id in ["a", "b", "c"] {
            p.add(new_job(id, 1)).await.unwrap();
        }
        let events = Arc::new(Recorder::default());
        let handler: Arc<dyn JobHandler> =
            Arc::new(|job: Job| async move { Ok::<_, JobFailure>(Some(job.data)) });
        let handle = p
            .process(handler, ProcessOptions::new(2), events.clone())
            .await
            .unwrap();

        wait_until(|| events.count(QueueEventKind::QueueDrained) == 1).await;
        assert_eq!(events.count(QueueEventKind::Completed), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.count(QueueEventKind::QueueDrained), 1);
        handle.shutdown(None).await;
    }

    #[tokio::test]
    async fn paused_pools_take_no_work() {
        let p = provider(config()).await;
        let events = Arc::new(Recorder::default());
        let handler: Arc<dyn JobHandler> =
            Arc::new(|_job: Job| async { Ok::<Option<Value>, JobFailure>(None) });
        let handle = p
            .process(handler, ProcessOptions::new(1), events.clone())
            .await
            .unwrap();

        p.pause().await.unwrap();
        p.add(new_job("held", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.count(QueueEventKind::Active), 0);

        p.resume().await.unwrap();
        wait_until(|| events.count(QueueEventKind::Completed) == 1).await;
        handle.shutdown(None).await;
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_handlers() {
        let p = provider(config()).await;
        p.add(new_job("slow", 1)).await.unwrap();
        let events = Arc::new(Recorder::default());
        let handler: Arc<dyn JobHandler> = Arc::new(|_job: Job| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<Option<Value>, JobFailure>(None)
        });
        let handle = p
            .process(handler, ProcessOptions::new(1), events.clone())
            .await
            .unwrap();
        wait_until(|| handle.in_flight() == 1).await;

        let outcome = handle.shutdown(Some(Duration::from_secs(5))).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(!handle.is_running());
        assert_eq!(events.count(QueueEventKind::Completed), 1);
        assert_eq!(events.count(QueueEventKind::ProcessorShuttingDown), 1);

        // idempotent
        assert_eq!(handle.shutdown(None).await, ShutdownOutcome::Drained);
        assert_eq!(events.count(QueueEventKind::ProcessorShuttingDown), 1);
    }

    #[tokio::test]
    async fn shutdown_timeout_abandons_and_releases() {
        let p = provider(config()).await;
        p.add(new_job("stuck", 2)).await.unwrap();
        let events = Arc::new(Recorder::default());
        let handler: Arc<dyn JobHandler> = Arc::new(|_job: Job| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<Option<Value>, JobFailure>(None)
        });
        let handle = p
            .process(handler, ProcessOptions::new(1), events.clone())
            .await
            .unwrap();
        wait_until(|| handle.in_flight() == 1).await;

        let outcome = handle.shutdown(Some(Duration::from_millis(20))).await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut { abandoned: 1 });
        assert_eq!(events.count(QueueEventKind::ProcessorShutdownTimeout), 1);

        let job = p.get_job(&JobId::new("stuck")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert_eq!(p.get_health().await.unwrap().active_workers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_timeout_lets_a_finishing_handler_complete() {
        let p = provider(config()).await;
        p.add(new_job("busy", 2)).await.unwrap();
        let events = Arc::new(Recorder::default());
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let handler: Arc<dyn JobHandler> = Arc::new(move |_job: Job| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                // blocks the worker thread: abort cannot interrupt this poll
                std::thread::sleep(Duration::from_millis(200));
                Ok::<Option<Value>, JobFailure>(None)
            }
        });
        let handle = p
            .process(handler, ProcessOptions::new(1), events.clone())
            .await
            .unwrap();
        wait_until(|| started.load(Ordering::SeqCst)).await;

        let outcome = handle.shutdown(Some(Duration::from_millis(20))).await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut { abandoned: 0 });
        let job = p.get_job(&JobId::new("busy")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(events.count(QueueEventKind::Completed), 1);
    }
}
