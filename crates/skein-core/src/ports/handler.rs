//! JobHandler port - push モードのハンドラ
//!
//! Object-safe: adapters store `Arc<dyn JobHandler>` and only ever see JSON
//! payloads. Typed handlers are adapted in `app::handler`.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Job, JobFailure};

/// `Ok(Some(v))` completes with a return value, `Err` goes to the adapter's
/// retry engine unmodified.
pub type HandlerResult = Result<Option<Value>, JobFailure>;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job<Value>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, job: Job<Value>) -> HandlerResult {
        self(job).await
    }
}
