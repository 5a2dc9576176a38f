//! Adapter implementations.
//!
//! - memory: プロセス内バックエンド（開発・テスト用、全 capability を切替可能）

pub mod memory;

pub use memory::{InMemoryProvider, MemoryBackendError, RetryPolicy};
