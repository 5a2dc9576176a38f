use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Duration, timeout};
use tracing_subscriber::EnvFilter;

use skein_core::domain::{Job, JobFailure, JobOptions, QueueError, QueueEvent};
use skein_core::ports::HandlerResult;
use skein_core::{
    Handler, InMemoryProvider, MemoryProviderConfig, ProcessOptions, QueueBuilder, QueueConfig,
    Result,
};

const GREETINGS: [&str; 3] = ["Alice", "Bob", "Carol"];

#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Fails the first `n` calls, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<HelloPayload> for HelloHandler {
    async fn handle(&self, job: Job<HelloPayload>) -> HandlerResult {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(JobFailure::new(format!(
                "upstream timed out (intentional, left={left})"
            )));
        }

        tracing::info!(job_id = %job.id, attempt = job.attempts, "Hello, {}!", job.data.name);
        Ok(Some(json!({ "greeted": job.data.name })))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `skein-cli [provider-config.json] [queue-config.json]`
fn load_configs() -> Result<(MemoryProviderConfig, QueueConfig)> {
    let read = |path: &str| {
        std::fs::read_to_string(path).map_err(|e| {
            QueueError::invalid_option(format!("cannot read {path}: {e}")).with_cause(Arc::new(e))
        })
    };

    let mut args = std::env::args().skip(1);
    let provider = match args.next() {
        Some(path) => MemoryProviderConfig::from_json_str(&read(&path)?)?,
        None => MemoryProviderConfig {
            retry: skein_core::RetryPolicy::fixed(Duration::from_millis(200)),
            ..MemoryProviderConfig::default()
        },
    };
    let queue = match args.next() {
        Some(path) => QueueConfig::from_json_str(&read(&path)?)?,
        None => QueueConfig {
            concurrency: 2,
            ..QueueConfig::default()
        },
    };
    Ok((provider, queue))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let (provider_config, queue_config) = load_configs()?;

    // (A) adapter と queue を用意
    let provider = Arc::new(InMemoryProvider::new("greetings", provider_config));
    let queue = QueueBuilder::new(provider)
        .config(queue_config)
        .build::<HelloPayload>()?;
    queue.connect().await?;

    // (B) イベントをログに流す
    let mut events = queue.events().subscribe();
    let expected = GREETINGS.len();
    let logger = tokio::spawn(async move {
        let mut finished = 0;
        while let Ok(event) = events.recv().await {
            match &event {
                QueueEvent::JobFailed { .. } | QueueEvent::QueueError { .. } => {
                    tracing::warn!("{}", event.description());
                }
                _ => tracing::info!("{}", event.description()),
            }
            if matches!(event, QueueEvent::JobCompleted { .. } | QueueEvent::JobFailed { .. }) {
                finished += 1;
                if finished == expected {
                    break;
                }
            }
        }
    });

    // (C) ジョブ投入
    for name in GREETINGS {
        let job = queue
            .add(
                "hello",
                HelloPayload { name: name.into() },
                JobOptions::new().attempts(3),
            )
            .await?;
        tracing::info!(job_id = %job.id, "enqueued");
    }

    // (D) push mode で処理
    let handle = queue
        .worker()
        .process(
            HelloHandler::new(2),
            Some(
                ProcessOptions::new(queue.config().concurrency)
                    .shutdown_timeout(queue.config().shutdown_timeout)
                    .on_error(|err| tracing::debug!(code = ?err.code(), "handler error")),
            ),
        )
        .await?;

    // (E) 全ジョブが終わるまで待って停止
    if timeout(Duration::from_secs(10), logger).await.is_err() {
        tracing::warn!("jobs did not finish within 10s");
    }
    let outcome = handle.shutdown(None).await;
    let stats = queue.get_stats().await?;
    tracing::info!(?outcome, ?stats, "done");

    queue.disconnect().await
}
