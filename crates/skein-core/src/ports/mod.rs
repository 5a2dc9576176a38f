//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! Backend engines plug in behind `QueueProvider`; time, id generation and
//! event delivery are injected through the remaining traits.
//!
//! # 設計原則
//! - アダプタがバックエンド接続を専有する
//! - retry / backoff の判断はアダプタが正本
//! - コアはペイロードの中身を見ない

pub mod clock;
pub mod event_sink;
pub mod handler;
pub mod id_generator;
pub mod provider;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EmitError, EventSink, NoopEventSink};
pub use self::handler::{HandlerResult, JobHandler};
pub use self::id_generator::{JobIdGenerator, UlidJobIdGenerator};
pub use self::provider::{
    ErrorCallback, ProcessOptions, ProcessorHandle, QueueProvider, ShutdownOutcome,
};
