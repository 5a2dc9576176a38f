//! skein-core
//!
//! Provider-agnostic job queue: one client API over interchangeable
//! backend adapters.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（job, options, errors, classify, events, capabilities, stats, envelope）
//! - **ports**: 抽象化レイヤー（QueueProvider, JobHandler, EventSink, Clock, JobIdGenerator）
//! - **app**: クライアント側ライフサイクル（QueueBuilder, Queue, Worker, EventChannel）
//! - **impls**: アダプタ実装（InMemoryProvider）
//! - **config**: JSON で読める設定レコード

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Delivery, EventChannel, Handler, Queue, QueueBuilder, Worker};
pub use config::{MemoryProviderConfig, QueueConfig};
pub use domain::{
    ActiveJob, ErrorKind, ErrorMapper, Job, JobFailure, JobId, JobOptions, JobStatus, QueueError,
    QueueEvent, QueueEventKind, Result,
};
pub use impls::{InMemoryProvider, RetryPolicy};
pub use ports::{ProcessOptions, ProcessorHandle, QueueProvider, ShutdownOutcome};
