//! Queue - 型付きクライアント
//!
//! `Queue<T>` validates and normalizes everything before the adapter sees
//! it: options, capability requirements and payload size are checked
//! locally, so an invalid call never costs a backend round trip.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::events::EventChannel;
use super::worker::Worker;
use crate::config::QueueConfig;
use crate::domain::{
    DataCode, ErrorMapper, HealthStatus, Job, JobDefaults, JobId, JobOptions, NewJob,
    ProviderCapabilities, QueueError, QueueEvent, QueueStats, Result, validate_queue_name,
};
use crate::ports::{Clock, JobIdGenerator, QueueProvider};

/// State shared by a queue and its workers.
pub(crate) struct QueueCore {
    pub(crate) provider: Arc<dyn QueueProvider>,
    pub(crate) config: QueueConfig,
    pub(crate) id_generator: Arc<dyn JobIdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventChannel,
    pub(crate) mapper: ErrorMapper,
}

impl QueueCore {
    pub(crate) fn name(&self) -> &str {
        self.provider.queue_name()
    }

    /// Publish, turning a fail-fast listener error into a `QueueError`.
    pub(crate) fn emit(&self, event: QueueEvent) -> Result<()> {
        self.events.emit(event).map_err(|e| self.mapper.map(e))
    }

    /// Per-call options fall back to these.
    fn effective_defaults(&self) -> JobDefaults {
        let mut defaults = self
            .config
            .defaults
            .over(&self.provider.default_job_options());
        // without retries the implicit default would be rejected on every add
        if defaults.attempts.is_none() && !self.provider.capabilities().supports_retries {
            defaults.attempts = Some(1);
        }
        defaults
    }
}

/// Typed client for one queue. Cheap to clone.
pub struct Queue<T> {
    core: Arc<QueueCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.core.name())
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn from_core(core: Arc<QueueCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> Arc<QueueCore> {
        Arc::clone(&self.core)
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        self.core.provider.capabilities()
    }

    pub fn events(&self) -> &EventChannel {
        &self.core.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.core.config
    }

    /// Pull/push consumer sharing this queue's adapter and events.
    pub fn worker(&self) -> Worker<T> {
        Worker::new(Arc::clone(&self.core))
    }

    pub async fn connect(&self) -> Result<()> {
        self.core.provider.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.core.provider.disconnect().await
    }

    /// Validate, normalize and submit one job.
    pub async fn add(&self, name: &str, data: T, options: JobOptions) -> Result<Job<T>> {
        let new_job = self.prepare(name, &data, options)?;
        let job = self.core.provider.add(new_job).await?;
        tracing::debug!(
            queue = %self.name(),
            job_id = %job.id,
            priority = ?job.priority,
            scheduled_for = ?job.scheduled_for,
            "job added"
        );
        Ok(job.map_data(|_| data))
    }

    /// All jobs are validated before the first backend call.
    pub async fn add_bulk(&self, jobs: Vec<(String, T, JobOptions)>) -> Result<Vec<Job<T>>> {
        self.capabilities().check_batch(jobs.len())?;

        let mut prepared = Vec::with_capacity(jobs.len());
        let mut payloads = Vec::with_capacity(jobs.len());
        for (name, data, options) in jobs {
            prepared.push(self.prepare(&name, &data, options)?);
            payloads.push(data);
        }

        let added = self.core.provider.add_bulk(prepared).await?;
        if added.len() != payloads.len() {
            return Err(QueueError::invalid_option(format!(
                "adapter returned {} jobs for a batch of {}",
                added.len(),
                payloads.len()
            )));
        }
        tracing::debug!(queue = %self.name(), count = added.len(), "bulk add");
        Ok(added
            .into_iter()
            .zip(payloads)
            .map(|(job, data)| job.map_data(|_| data))
            .collect())
    }

    /// `Ok(None)` when the job does not exist.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job<T>>> {
        match self.core.provider.get_job(id).await? {
            Some(job) => Ok(Some(self.decode(job)?)),
            None => Ok(None),
        }
    }

    /// Like `get_job`, without decoding the payload.
    pub async fn get_raw_job(&self, id: &JobId) -> Result<Option<Job<Value>>> {
        self.core.provider.get_job(id).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.core.provider.pause().await?;
        tracing::info!(queue = %self.name(), "queue paused");
        self.core.emit(QueueEvent::QueuePaused {
            queue: self.name().to_string(),
            timestamp: self.core.clock.now(),
        })
    }

    pub async fn resume(&self) -> Result<()> {
        self.core.provider.resume().await?;
        tracing::info!(queue = %self.name(), "queue resumed");
        self.core.emit(QueueEvent::QueueResumed {
            queue: self.name().to_string(),
            timestamp: self.core.clock.now(),
        })
    }

    /// Destroys the queue and all its jobs.
    pub async fn delete(&self) -> Result<()> {
        self.core.provider.delete().await?;
        tracing::info!(queue = %self.name(), "queue deleted");
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.core.provider.get_stats().await
    }

    pub async fn get_health(&self) -> Result<HealthStatus> {
        self.core.provider.get_health().await
    }

    /// Dead-lettered jobs, raw: their payloads may be why they failed.
    pub async fn get_dlq_jobs(&self, limit: usize) -> Result<Vec<Job<Value>>> {
        self.capabilities().require_dlq()?;
        self.core.provider.get_dlq_jobs(limit).await
    }

    pub async fn retry_job(&self, id: &JobId) -> Result<()> {
        self.capabilities().require_retries()?;
        self.core.provider.retry_job(id).await?;
        tracing::info!(queue = %self.name(), job_id = %id, "job retried manually");
        Ok(())
    }

    fn prepare(&self, name: &str, data: &T, options: JobOptions) -> Result<NewJob> {
        validate_queue_name(self.name())?;
        if name.is_empty() {
            return Err(QueueError::invalid_option("job name must not be empty"));
        }

        let options = options.normalize(
            &self.core.effective_defaults(),
            self.core.id_generator.as_ref(),
            self.core.clock.now(),
        )?;
        let capabilities = self.capabilities();
        capabilities.check_options(&options)?;

        let data = serde_json::to_value(data).map_err(|e| self.core.mapper.map(e))?;
        if let Some(max) = capabilities.max_job_size {
            let size = serde_json::to_vec(&data)
                .map_err(|e| self.core.mapper.map(e))?
                .len();
            if size > max {
                return Err(QueueError::data(
                    DataCode::PayloadTooLarge,
                    format!("payload of {size} bytes exceeds the provider maximum of {max}"),
                ));
            }
        }

        Ok(NewJob {
            name: name.to_string(),
            data,
            options,
        })
    }

    fn decode(&self, job: Job<Value>) -> Result<Job<T>> {
        job.try_map_data(serde_json::from_value::<T>)
            .map_err(|e| self.core.mapper.map(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::QueueBuilder;
    use crate::config::MemoryProviderConfig;
    use crate::domain::{
        ConfigurationCode, ErrorKind, JobStatus, ProviderCapabilities, ProviderOptions, Retention,
    };
    use crate::impls::InMemoryProvider;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    fn email() -> Email {
        Email {
            to: "a@example.com".into(),
        }
    }

    async fn queue_with(config: MemoryProviderConfig) -> (Queue<Email>, Arc<InMemoryProvider>) {
        let provider = Arc::new(InMemoryProvider::new("mail", config));
        let queue = QueueBuilder::new(provider.clone())
            .build::<Email>()
            .unwrap();
        queue.connect().await.unwrap();
        (queue, provider)
    }

    async fn queue() -> Queue<Email> {
        queue_with(MemoryProviderConfig::default()).await.0
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let queue = queue().await;
        let job = queue
            .add("send", email(), JobOptions::new().metadata("tenant", "acme".into()))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.max_attempts, 3);

        let back = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(back.data, email());
        assert_eq!(back.metadata, job.metadata);
        assert_eq!(back.name, "send");
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let queue = queue().await;
        assert!(queue.get_job(&JobId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_generator_names_jobs() {
        let provider = Arc::new(InMemoryProvider::new("mail", MemoryProviderConfig::default()));
        let queue = QueueBuilder::new(provider)
            .id_generator(Arc::new(|| "fixed-id".to_string()))
            .build::<Email>()
            .unwrap();
        queue.connect().await.unwrap();

        let job = queue.add("send", email(), JobOptions::new()).await.unwrap();
        assert_eq!(job.id.as_str(), "fixed-id");

        // same id again is a duplicate
        let err = queue.add("send", email(), JobOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), Some("DUPLICATE"));
    }

    #[tokio::test]
    async fn oversized_payloads_are_data_errors() {
        let (queue, provider) = queue_with(MemoryProviderConfig {
            capabilities: ProviderCapabilities {
                max_job_size: Some(8),
                ..ProviderCapabilities::default()
            },
            ..MemoryProviderConfig::default()
        })
        .await;
        let calls = provider.backend_calls();
        let err = queue.add("send", email(), JobOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert_eq!(err.code(), Some("PAYLOAD_TOO_LARGE"));
        assert_eq!(provider.backend_calls(), calls);
    }

    #[tokio::test]
    async fn bulk_add_is_gated_by_batch_size() {
        let (queue, provider) = queue_with(MemoryProviderConfig {
            capabilities: ProviderCapabilities {
                max_batch_size: Some(2),
                ..ProviderCapabilities::default()
            },
            ..MemoryProviderConfig::default()
        })
        .await;

        let batch = |n: usize| {
            (0..n)
                .map(|i| (format!("send-{i}"), email(), JobOptions::new()))
                .collect::<Vec<_>>()
        };
        let added = queue.add_bulk(batch(2)).await.unwrap();
        assert_eq!(added.len(), 2);

        let calls = provider.backend_calls();
        let err = queue.add_bulk(batch(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(provider.backend_calls(), calls);
    }

    #[tokio::test]
    async fn bulk_add_validates_everything_first() {
        let (queue, provider) = queue_with(MemoryProviderConfig::default()).await;
        let calls = provider.backend_calls();
        let err = queue
            .add_bulk(vec![
                ("ok".into(), email(), JobOptions::new()),
                ("bad".into(), email(), JobOptions::new().priority(-3)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Configuration {
                code: ConfigurationCode::InvalidOption,
                ..
            }
        ));
        assert_eq!(provider.backend_calls(), calls);
        assert_eq!(queue.get_stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn run_at_uses_the_injected_clock() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let clock = FixedClock::new(now);
        let provider = Arc::new(InMemoryProvider::new("mail", MemoryProviderConfig::default()));
        let queue = QueueBuilder::new(provider)
            .clock(Arc::new(clock))
            .build::<Email>()
            .unwrap();
        queue.connect().await.unwrap();

        let job = queue
            .add(
                "send",
                email(),
                JobOptions::new().run_at(now + chrono::Duration::seconds(2)),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
    }

    #[tokio::test]
    async fn minimal_adapters_default_to_a_single_attempt() {
        let (queue, _) = queue_with(MemoryProviderConfig {
            capabilities: ProviderCapabilities::minimal(),
            ..MemoryProviderConfig::default()
        })
        .await;
        let job = queue.add("send", email(), JobOptions::new()).await.unwrap();
        assert_eq!(job.max_attempts, 1);

        let err = queue
            .add("send", email(), JobOptions::new().delay(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("UNSUPPORTED_CAPABILITY"));
    }

    #[tokio::test]
    async fn provider_options_cannot_touch_identity() {
        let queue = queue().await;
        let job = queue
            .add(
                "send",
                email(),
                JobOptions::new()
                    .job_id("stable")
                    .attempts(2)
                    .provider_options(ProviderOptions::default().remove_on_complete(Retention::Remove)),
            )
            .await
            .unwrap();
        assert_eq!(job.id.as_str(), "stable");
        assert_eq!(job.max_attempts, 2);
    }

    #[tokio::test]
    async fn dlq_calls_are_gated() {
        let (queue, provider) = queue_with(MemoryProviderConfig {
            capabilities: ProviderCapabilities::minimal(),
            ..MemoryProviderConfig::default()
        })
        .await;
        let calls = provider.backend_calls();
        let err = queue.get_dlq_jobs(10).await.unwrap_err();
        assert_eq!(err.code(), Some("UNSUPPORTED_CAPABILITY"));
        let err = queue.retry_job(&JobId::new("x")).await.unwrap_err();
        assert_eq!(err.code(), Some("UNSUPPORTED_CAPABILITY"));
        assert_eq!(provider.backend_calls(), calls);
    }

    #[tokio::test]
    async fn pause_and_resume_publish_events() {
        let queue = queue().await;
        let mut rx = queue.events().subscribe();
        queue.pause().await.unwrap();
        assert!(queue.get_stats().await.unwrap().paused);
        queue.resume().await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind().as_str(), "queue.paused");
        assert_eq!(rx.recv().await.unwrap().kind().as_str(), "queue.resumed");
        assert!(!queue.get_stats().await.unwrap().paused);
    }
}
