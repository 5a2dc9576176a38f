//! EventChannel - 型付きイベントチャネル
//!
//! Listeners are registered with one of two delivery policies:
//!
//! - **fail-fast** (`on`): a listener error propagates to the caller of
//!   `emit` and stops delivery of that event.
//! - **safe** (`on_safe`): a listener error is classified and re-published as
//!   a `queue.error` event; delivery continues with the next listener.
//!
//! A safe listener failing on a `queue.error` event is rethrown instead, so an
//! erroring error handler cannot loop. The decision depends only on the event
//! being dispatched, so concurrent emits from other tasks are unaffected.
//!
//! Every event is also sent to a `tokio::sync::broadcast` stream for
//! consumers that prefer `subscribe()` over callbacks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::domain::{BoxError, ErrorMapper, QueueEvent, QueueEventKind};
use crate::ports::{Clock, EmitError, EventSink, SystemClock};

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&QueueEvent) -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Failure-handling policy of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    FailFast,
    Safe,
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    /// `None` receives every event.
    filter: Option<QueueEventKind>,
    delivery: Delivery,
    listener: Listener,
}

struct Inner {
    queue: String,
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<QueueEvent>,
    mapper: ErrorMapper,
    clock: Arc<dyn Clock>,
}

/// Cheap to clone; clones share listeners and the stream.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("queue", &self.inner.queue)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventChannel {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(queue: impl Into<String>) -> Self {
        Self::with_clock(queue, Arc::new(SystemClock), Self::DEFAULT_CAPACITY)
    }

    /// `capacity` bounds the broadcast buffer; slow subscribers lag.
    pub fn with_clock(queue: impl Into<String>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                queue: queue.into(),
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stream,
                mapper: ErrorMapper::new(),
                clock,
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn register(
        &self,
        filter: Option<QueueEventKind>,
        delivery: Delivery,
        listener: Listener,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner());
        listeners.push(Registration {
            id,
            filter,
            delivery,
            listener,
        });
        id
    }

    /// Fail-fast listener for one event kind.
    pub fn on<F>(&self, kind: QueueEventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(Some(kind), Delivery::FailFast, Arc::new(f))
    }

    /// Safe listener for one event kind.
    pub fn on_safe<F>(&self, kind: QueueEventKind, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(Some(kind), Delivery::Safe, Arc::new(f))
    }

    /// Listener for every event kind.
    pub fn on_any<F>(&self, delivery: Delivery, f: F) -> ListenerId
    where
        F: Fn(&QueueEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(None, delivery, Arc::new(f))
    }

    /// Returns false when `id` was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.stream.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) -> Result<(), EmitError> {
        let kind = event.kind();
        tracing::trace!(queue = %self.inner.queue, event = %kind, "{}", event.description());

        // no receivers is fine
        let _ = self.inner.stream.send(event.clone());

        // safe failures inside a queue.error dispatch are rethrown
        let is_error_event = kind == QueueEventKind::QueueError;

        // Snapshot so listeners may register/unregister while being called.
        let snapshot: Vec<Registration> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.filter.is_none_or(|k| k == kind))
            .cloned()
            .collect();

        for registration in snapshot {
            let Err(source) = (registration.listener)(&event) else {
                continue;
            };
            match registration.delivery {
                Delivery::FailFast => return Err(EmitError::Listener { event: kind, source }),
                Delivery::Safe => {
                    if is_error_event {
                        return Err(EmitError::Listener { event: kind, source });
                    }
                    tracing::warn!(
                        queue = %self.inner.queue,
                        event = %kind,
                        "safe listener failed: {source}"
                    );
                    let error = self.inner.mapper.map(source).info();
                    self.emit(QueueEvent::queue_error(
                        &self.inner.queue,
                        error,
                        Some(kind),
                        self.inner.clock.now(),
                    ))?;
                }
            }
        }
        Ok(())
    }
}

impl EventSink for EventChannel {
    fn emit(&self, event: QueueEvent) -> Result<(), EmitError> {
        EventChannel::emit(self, event)
    }
}
