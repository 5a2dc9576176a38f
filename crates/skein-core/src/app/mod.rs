//! App - クライアント側のライフサイクル
//!
//! - **builder**: `QueueBuilder`（起動時検証と依存性注入）
//! - **queue**: `Queue<T>`（enqueue, 管理操作）
//! - **worker**: `Worker<T>`（fetch / ack / nack, process）
//! - **events**: `EventChannel`（fail-fast / safe リスナー）
//! - **handler**: `Handler<T>` と type erasure

pub mod builder;
pub mod events;
pub mod handler;
pub mod queue;
pub mod worker;

pub use self::builder::QueueBuilder;
pub use self::events::{Delivery, EventChannel, Listener, ListenerId};
pub use self::handler::{Handler, TypedHandler};
pub use self::queue::Queue;
pub use self::worker::Worker;
