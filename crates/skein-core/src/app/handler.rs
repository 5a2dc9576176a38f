//! Handler trait - 型付きハンドラ
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `dyn JobHandler`)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{DataCode, Job, JobFailure, QueueError};
use crate::ports::{HandlerResult, JobHandler};

/// Handler は `Job<T>` を処理する
///
/// `Handler<Invoice>` only ever sees decoded `Invoice` payloads; decoding
/// happens once, in [`TypedHandler`].
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, job: Job<T>) -> HandlerResult;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Job<T>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, job: Job<T>) -> HandlerResult {
        self(job).await
    }
}

/// Erases `T`: decodes the JSON payload, then calls the typed handler.
///
/// A payload that does not decode is a permanent data failure; retrying
/// cannot fix it.
pub struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> JobHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn handle(&self, job: Job<Value>) -> HandlerResult {
        let job = job.try_map_data(serde_json::from_value::<T>).map_err(|e| {
            JobFailure::from(QueueError::data(
                DataCode::Serialization,
                format!("payload does not decode: {e}"),
            ))
        })?;
        self.handler.handle(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobStatus, Metadata};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Email {
        to: String,
    }

    struct EmailHandler;

    #[async_trait]
    impl Handler<Email> for EmailHandler {
        async fn handle(&self, job: Job<Email>) -> HandlerResult {
            Ok(Some(json!({ "sent_to": job.data.to })))
        }
    }

    fn job(data: Value) -> Job<Value> {
        Job {
            id: JobId::new("1"),
            name: "email".into(),
            queue_name: "mail".into(),
            data,
            status: JobStatus::Active,
            attempts: 1,
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

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<Email, _>::new(EmailHandler);
        let out = handler.handle(job(json!({"to": "a@example.com"}))).await.unwrap();
        assert_eq!(out, Some(json!({"sent_to": "a@example.com"})));
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<Email, _>::new(EmailHandler);
        let err = handler.handle(job(json!({"nope": 1}))).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = TypedHandler::<u32, _>::new(|job: Job<u32>| async move {
            if job.data > 10 {
                Err(JobFailure::new("too big"))
            } else {
                Ok(None::<Value>)
            }
        });
        assert!(handler.handle(job(json!(3))).await.is_ok());
        assert!(handler.handle(job(json!(30))).await.is_err());
    }
}
