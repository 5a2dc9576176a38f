//! Worker - pull / push の消費側ライフサイクル
//!
//! Pull: `fetch` → handler code → `ack` / `nack`.
//! Push: `process` hands a typed handler to the adapter's bounded pool.
//!
//! The worker never decides retries. `nack` classifies the failure for the
//! event payload, forwards the failure itself to the adapter and publishes
//! whatever the adapter reports back.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::handler::{Handler, TypedHandler};
use super::queue::QueueCore;
use crate::domain::{
    ActiveJob, DataCode, JobFailure, LeaseToken, NackOutcome, QueueError, QueueEvent, Result,
};
use crate::ports::{EventSink, JobHandler, ProcessOptions, ProcessorHandle};

pub struct Worker<T> {
    core: Arc<QueueCore>,
    /// Set once this worker finalized a job; cleared when `queue.drained`
    /// is published.
    had_work: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.core.name())
            .finish()
    }
}

impl<T> Worker<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Self {
            core,
            had_work: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.core.name()
    }

    /// Check out up to `count` jobs.
    ///
    /// Jobs whose payload does not decode as `T` are nacked as permanent
    /// data failures and reported with a `failed` event instead of being
    /// returned. If publishing or nacking fails, every lease not yet handed
    /// to the caller is released before the error is returned.
    pub async fn fetch(&self, count: usize) -> Result<Vec<ActiveJob<T>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let fetched = self.core.provider.fetch(count).await?;
        if fetched.is_empty() {
            self.maybe_drained().await?;
            return Ok(Vec::new());
        }

        let mut decoded = Vec::with_capacity(fetched.len());
        let mut first_error = None;
        for active in fetched {
            if first_error.is_some() {
                self.give_back(active.token()).await;
                continue;
            }
            match self.check_out(active).await {
                Ok(Some(job)) => decoded.push(job),
                Ok(None) => {}
                Err(err) => first_error = Some(err),
            }
        }

        if let Some(err) = first_error {
            for job in &decoded {
                self.give_back(job.token()).await;
            }
            return Err(err);
        }
        Ok(decoded)
    }

    /// Publish `active` and decode; `Ok(None)` when the payload was nacked.
    async fn check_out(&self, active: ActiveJob<Value>) -> Result<Option<ActiveJob<T>>> {
        let now = self.core.clock.now();
        if let Err(err) = self.core.emit(QueueEvent::active(&active.job, now)) {
            self.give_back(active.token()).await;
            return Err(err);
        }
        tracing::debug!(
            queue = %self.queue_name(),
            job_id = %active.id(),
            attempts = active.job.attempts,
            "job checked out"
        );

        let (token, e) = match active.try_map_data(serde_json::from_value::<T>) {
            Ok(job) => return Ok(Some(job)),
            Err(undecodable) => undecodable,
        };
        tracing::warn!(
            queue = %self.queue_name(),
            job_id = %token.job_id(),
            "payload does not decode: {e}"
        );
        let error = QueueError::data(
            DataCode::Serialization,
            format!("payload does not decode: {e}"),
        )
        .with_cause(Arc::new(e));
        let failure = JobFailure::from(error.clone());
        let outcome = match self.core.provider.nack(&token, &failure).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.give_back(&token).await;
                return Err(err);
            }
        };
        self.had_work.store(true, Ordering::SeqCst);
        self.core.emit(QueueEvent::after_nack(
            self.queue_name(),
            token.job_id(),
            &outcome,
            error.info(),
            self.core.clock.now(),
        ))?;
        Ok(None)
    }

    /// Release a lease the caller never received.
    async fn give_back(&self, token: &LeaseToken) {
        if let Err(err) = self.core.provider.release(token).await {
            tracing::warn!(
                queue = %self.queue_name(),
                job_id = %token.job_id(),
                error = %err,
                "could not release lease"
            );
        }
    }

    /// Finalize success. Consumes the lease: a second `ack`/`nack` with the
    /// same job is `QueueError::NotFound`.
    pub async fn ack(&self, job: &ActiveJob<T>, result: Option<Value>) -> Result<()> {
        self.core.provider.ack(job.token(), result.clone()).await?;
        self.had_work.store(true, Ordering::SeqCst);
        tracing::debug!(queue = %self.queue_name(), job_id = %job.id(), "job completed");
        self.core
            .emit(QueueEvent::completed(&job.job, result, self.core.clock.now()))
    }

    /// Report failure. The adapter decides retry vs. dead-letter; the
    /// returned outcome is what it reported.
    pub async fn nack(
        &self,
        job: &ActiveJob<T>,
        failure: impl Into<JobFailure>,
    ) -> Result<NackOutcome> {
        let failure = failure.into();
        let error = self.core.mapper.map_failure(&failure);
        let outcome = self.core.provider.nack(job.token(), &failure).await?;
        self.had_work.store(true, Ordering::SeqCst);

        tracing::debug!(
            queue = %self.queue_name(),
            job_id = %job.id(),
            attempts = outcome.attempts,
            will_retry = outcome.will_retry,
            "job failed: {}",
            failure.message()
        );
        self.core.emit(QueueEvent::after_nack(
            self.queue_name(),
            job.id(),
            &outcome,
            error.info(),
            self.core.clock.now(),
        ))?;
        Ok(outcome)
    }

    /// Start the adapter's push-mode pool with a typed handler.
    ///
    /// `options` defaults to the queue config's concurrency and shutdown
    /// timeout.
    pub async fn process<H>(
        &self,
        handler: H,
        options: Option<ProcessOptions>,
    ) -> Result<Arc<dyn ProcessorHandle>>
    where
        H: Handler<T> + 'static,
    {
        let options = options.unwrap_or_else(|| {
            ProcessOptions::new(self.core.config.concurrency)
                .shutdown_timeout(self.core.config.shutdown_timeout)
        });
        options.validate()?;

        let handler: Arc<dyn JobHandler> = Arc::new(TypedHandler::<T, H>::new(handler));
        let events: Arc<dyn EventSink> = Arc::new(self.core.events.clone());
        tracing::info!(
            queue = %self.queue_name(),
            concurrency = options.concurrency,
            "starting processor"
        );
        self.core.provider.process(handler, options, events).await
    }

    async fn maybe_drained(&self) -> Result<()> {
        if !self.had_work.load(Ordering::SeqCst) {
            return Ok(());
        }
        let stats = self.core.provider.get_stats().await?;
        if stats.waiting == 0 && !stats.paused && self.had_work.swap(false, Ordering::SeqCst) {
            tracing::debug!(queue = %self.queue_name(), "queue drained");
            self.core.emit(QueueEvent::QueueDrained {
                queue: self.queue_name().to_string(),
                timestamp: self.core.clock.now(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Queue, QueueBuilder};
    use crate::config::MemoryProviderConfig;
    use crate::domain::{ErrorKind, Job, JobOptions, QueueEventKind, RuntimeCode};
    use crate::impls::{InMemoryProvider, RetryPolicy};
    use std::time::Duration;

    async fn queue<T>() -> Queue<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let provider = Arc::new(InMemoryProvider::new(
            "work",
            MemoryProviderConfig {
                retry: RetryPolicy::immediate(),
                ..MemoryProviderConfig::default()
            },
        ));
        let queue = QueueBuilder::new(provider).build::<T>().unwrap();
        queue.connect().await.unwrap();
        queue
    }

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<QueueEvent>) -> Vec<QueueEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind());
        }
        out
    }

    #[tokio::test]
    async fn fetch_ack_publishes_active_completed_drained() {
        let queue = queue::<u32>().await;
        let worker = queue.worker();
        let mut rx = queue.events().subscribe();

        queue.add("n", 1, JobOptions::new()).await.unwrap();
        let jobs = worker.fetch(5).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(*jobs[0].data(), 1);
        worker.ack(&jobs[0], Some(Value::from(2))).await.unwrap();

        assert!(worker.fetch(1).await.unwrap().is_empty());
        assert_eq!(
            kinds(&mut rx),
            vec![
                QueueEventKind::Active,
                QueueEventKind::Completed,
                QueueEventKind::QueueDrained
            ]
        );

        // edge-triggered: no second drained without new work
        assert!(worker.fetch(1).await.unwrap().is_empty());
        assert!(kinds(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn second_ack_is_not_found() {
        let queue = queue::<u32>().await;
        let worker = queue.worker();
        queue.add("n", 1, JobOptions::new()).await.unwrap();
        let job = worker.fetch(1).await.unwrap().remove(0);

        worker.ack(&job, None).await.unwrap();
        let err = worker.ack(&job, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = worker.nack(&job, "late").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn nack_publishes_retrying_then_failed() {
        let queue = queue::<u32>().await;
        let worker = queue.worker();
        let mut rx = queue.events().subscribe();
        queue
            .add("n", 1, JobOptions::new().attempts(2))
            .await
            .unwrap();

        let retryable = QueueError::runtime(RuntimeCode::Timeout, true, "upstream timed out");

        let job = worker.fetch(1).await.unwrap().remove(0);
        let outcome = worker.nack(&job, retryable.clone()).await.unwrap();
        assert!(outcome.will_retry);
        assert_eq!((outcome.attempts, outcome.max_attempts), (1, 2));

        let job = worker.fetch(1).await.unwrap().remove(0);
        let outcome = worker.nack(&job, retryable).await.unwrap();
        assert!(!outcome.will_retry);
        assert_eq!((outcome.attempts, outcome.max_attempts), (2, 2));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| {
                matches!(
                    e.kind(),
                    QueueEventKind::JobRetrying | QueueEventKind::Failed
                )
            })
            .collect();
        assert_eq!(events.len(), 2);
        match &events[0] {
            QueueEvent::JobRetrying {
                will_retry, error, ..
            } => {
                assert!(*will_retry);
                assert_eq!(error.code.as_deref(), Some("TIMEOUT"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[1] {
            QueueEvent::JobFailed {
                will_retry,
                attempts,
                max_attempts,
                ..
            } => {
                assert!(!*will_retry);
                assert_eq!(attempts, max_attempts);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_payloads_fail_permanently() {
        let raw = queue::<Value>().await;
        raw.add("n", Value::from("not a number"), JobOptions::new().attempts(5))
            .await
            .unwrap();

        // same adapter, typed view
        let typed: Queue<u32> = Queue::from_core(raw.core());
        let worker = typed.worker();
        let mut rx = typed.events().subscribe();

        assert!(worker.fetch(1).await.unwrap().is_empty());
        let failed = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|e| e.kind() == QueueEventKind::Failed);
        match failed {
            Some(QueueEvent::JobFailed { error, .. }) => {
                assert_eq!(error.code.as_deref(), Some("SERIALIZATION"));
            }
            other => panic!("expected failed event, got {other:?}"),
        }
        assert_eq!(raw.get_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn failed_active_listener_releases_every_lease() {
        let queue = queue::<u32>().await;
        let worker = queue.worker();
        for n in 0..2 {
            queue.add("n", n, JobOptions::new()).await.unwrap();
        }
        let broken = queue.events().on(QueueEventKind::Active, |_event| {
            Err(crate::domain::BoxError::from("listener broke"))
        });

        assert!(worker.fetch(2).await.is_err());
        let stats = queue.get_stats().await.unwrap();
        assert_eq!((stats.waiting, stats.active), (2, 0));

        queue.events().off(broken);
        let jobs = worker.fetch(2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.job.attempts == 1));
    }

    #[tokio::test]
    async fn process_runs_typed_handler() {
        let queue = queue::<u32>().await;
        let mut rx = queue.events().subscribe();
        for n in 0..3 {
            queue.add("n", n, JobOptions::new()).await.unwrap();
        }

        let handle = queue
            .worker()
            .process(
                |job: Job<u32>| async move { Ok::<_, JobFailure>(Some(Value::from(job.data * 2))) },
                Some(ProcessOptions::new(2)),
            )
            .await
            .unwrap();

        let mut completed = 0;
        while completed < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if event.kind() == QueueEventKind::Completed {
                completed += 1;
            }
        }
        handle.shutdown(None).await;
        assert_eq!(queue.get_stats().await.unwrap().completed, 3);
    }
}
