//! IdGenerator port - ジョブ ID 生成の抽象化
//!
//! A generator is a zero-argument source of collision-resistant strings. It
//! is injected into the queue at construction time and can be overridden
//! per call through `JobOptions`.
//!
//! # 実装
//! - **UlidJobIdGenerator**: ULID ベース（デフォルト）
//! - any `Fn() -> String + Send + Sync` closure

use ulid::Ulid;

use crate::domain::JobId;
use crate::ports::{Clock, SystemClock};

/// JobIdGenerator は一意な job id を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait JobIdGenerator: Send + Sync {
    fn generate(&self) -> JobId;
}

impl<F> JobIdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> JobId {
        JobId::new(self())
    }
}

/// ULID based generator.
///
/// Time comes from the `Clock`, the 80 random bits from `rand`, so ids stay
/// unique even under a `FixedClock`.
#[derive(Debug, Clone, Default)]
pub struct UlidJobIdGenerator<C = SystemClock> {
    clock: C,
}

impl<C: Clock> UlidJobIdGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> JobIdGenerator for UlidJobIdGenerator<C> {
    fn generate(&self) -> JobId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        JobId::new(ulid.to_string())
    }
}
