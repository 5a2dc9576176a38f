//! EventSink port - イベント配信の抽象化
//!
//! Adapters publish push-mode lifecycle events through this trait without
//! knowing about listener registration. The app layer's `EventChannel` is
//! the implementation used in practice.

use thiserror::Error;

use crate::domain::{BoxError, QueueEvent, QueueEventKind};

/// A listener rejected an event.
#[derive(Debug, Error)]
pub enum EmitError {
    /// Fail-fast listener error, or a safe listener failing on a
    /// `queue.error` event.
    #[error("listener for `{event}` failed: {source}")]
    Listener {
        event: QueueEventKind,
        #[source]
        source: BoxError,
    },
}

/// EventSink はキューイベントを配信
pub trait EventSink: Send + Sync {
    fn emit(&self, event: QueueEvent) -> Result<(), EmitError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: QueueEvent) -> Result<(), EmitError> {
        Ok(())
    }
}
