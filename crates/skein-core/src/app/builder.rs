//! QueueBuilder - キューの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 依存性注入（id generator, clock, event channel）

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::events::EventChannel;
use super::queue::{Queue, QueueCore};
use crate::config::QueueConfig;
use crate::domain::{ErrorMapper, QueueError, Result, validate_queue_name};
use crate::ports::{Clock, JobIdGenerator, QueueProvider, SystemClock, UlidJobIdGenerator};

/// QueueBuilder は `Queue<T>` を構築
///
/// # 使用例
/// ```ignore
/// let queue = QueueBuilder::new(provider)
///     .config(QueueConfig::default())
///     .id_generator(Arc::new(|| uuid()))
///     .build::<Email>()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に queue 名・設定・既定値と capability の整合性をチェック
/// - 問題があれば ConfigurationError を返す
pub struct QueueBuilder {
    provider: Arc<dyn QueueProvider>,
    config: QueueConfig,
    id_generator: Option<Arc<dyn JobIdGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventChannel>,
    mapper: ErrorMapper,
}

impl QueueBuilder {
    pub fn new(provider: Arc<dyn QueueProvider>) -> Self {
        Self {
            provider,
            config: QueueConfig::default(),
            id_generator: None,
            clock: None,
            events: None,
            mapper: ErrorMapper::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Default generator for jobs added without an explicit id.
    pub fn id_generator(mut self, id_gen: Arc<dyn JobIdGenerator>) -> Self {
        self.id_generator = Some(id_gen);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share an existing channel (must belong to the same queue).
    pub fn events(mut self, events: EventChannel) -> Self {
        self.events = Some(events);
        self
    }

    /// Mapper used to classify client-side failures (serialization,
    /// handler failures, listener errors).
    pub fn error_mapper(mut self, mapper: ErrorMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// # 検証
    /// - queue 名が空でないこと
    /// - QueueConfig が妥当であること
    /// - 既定の priority / attempts を adapter が扱えること
    /// - 渡された EventChannel が同じ queue のものであること
    pub fn build<T>(self) -> Result<Queue<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let queue_name = self.provider.queue_name().to_string();
        validate_queue_name(&queue_name)?;
        self.config.validate()?;

        let capabilities = self.provider.capabilities();
        if self.config.defaults.priority.is_some() && !capabilities.supports_priority {
            return Err(QueueError::unsupported("job priority (queue default)"));
        }
        if self.config.defaults.attempts.is_some_and(|a| a > 1) && !capabilities.supports_retries {
            return Err(QueueError::unsupported("retries (queue default attempts > 1)"));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = match self.events {
            Some(events) if events.queue() != queue_name => {
                return Err(QueueError::invalid_option(format!(
                    "event channel belongs to `{}`, not `{queue_name}`",
                    events.queue()
                )));
            }
            Some(events) => events,
            None => EventChannel::with_clock(
                queue_name.clone(),
                Arc::clone(&clock),
                self.config.event_capacity,
            ),
        };
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(UlidJobIdGenerator::new(Arc::clone(&clock))));

        tracing::debug!(queue = %queue_name, "queue built");
        Ok(Queue::from_core(Arc::new(QueueCore {
            provider: self.provider,
            config: self.config,
            id_generator,
            clock,
            events,
            mapper: self.mapper,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryProviderConfig;
    use crate::domain::{ConfigurationCode, JobDefaults, ProviderCapabilities};
    use crate::impls::InMemoryProvider;
    use serde_json::Value;

    fn provider(name: &str, capabilities: ProviderCapabilities) -> Arc<dyn QueueProvider> {
        Arc::new(InMemoryProvider::new(
            name,
            MemoryProviderConfig {
                capabilities,
                ..MemoryProviderConfig::default()
            },
        ))
    }

    fn code(err: QueueError) -> Option<ConfigurationCode> {
        match err {
            QueueError::Configuration { code, .. } => Some(code),
            _ => None,
        }
    }

    #[test]
    fn test_build_success() {
        let queue = QueueBuilder::new(provider("mail", ProviderCapabilities::default()))
            .build::<Value>()
            .unwrap();
        assert_eq!(queue.name(), "mail");
        assert_eq!(queue.events().queue(), "mail");
    }

    #[test]
    fn test_build_rejects_empty_queue_name() {
        let err = QueueBuilder::new(provider("", ProviderCapabilities::default()))
            .build::<Value>()
            .err()
            .unwrap();
        assert_eq!(code(err), Some(ConfigurationCode::InvalidOption));
    }

    #[test]
    fn test_build_rejects_defaults_the_adapter_cannot_honor() {
        let config = QueueConfig {
            defaults: JobDefaults {
                priority: Some(5),
                ..JobDefaults::default()
            },
            ..QueueConfig::default()
        };
        let err = QueueBuilder::new(provider("mail", ProviderCapabilities::minimal()))
            .config(config)
            .build::<Value>()
            .err()
            .unwrap();
        assert_eq!(code(err), Some(ConfigurationCode::UnsupportedCapability));
    }

    #[test]
    fn test_build_rejects_foreign_event_channel() {
        let err = QueueBuilder::new(provider("mail", ProviderCapabilities::default()))
            .events(EventChannel::new("billing"))
            .build::<Value>()
            .err()
            .unwrap();
        assert_eq!(code(err), Some(ConfigurationCode::InvalidOption));
    }
}
