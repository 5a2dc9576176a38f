//! Push-mode worker pool for the in-memory adapter.
//!
//! - N 個の worker loop を spawn し、shutdown は watch channel で通知
//! - handler の panic は `catch_unwind` で JobFailure に変換
//! - ack/nack は pull mode と同じ state 操作を使う

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::Shared;

/// How long aborted workers get to unwind before their leases are released.
const ABORT_GRACE: Duration = Duration::from_secs(1);
use crate::domain::{
    ActiveJob, ConfigurationCode, JobFailure, LeaseId, LeaseToken, QueueError, QueueEvent,
};
use crate::ports::{
    ErrorCallback, EventSink, JobHandler, ProcessOptions, ProcessorHandle, ShutdownOutcome,
};

/// State shared by every worker loop of one pool.
struct PoolContext {
    shared: Arc<Shared>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn EventSink>,
    on_error: Option<ErrorCallback>,
    in_flight: AtomicUsize,
    /// Leases held by running handlers; released if the drain times out.
    leases: StdMutex<HashMap<LeaseId, LeaseToken>>,
    /// Set after each handled job, cleared when `queue.drained` fires.
    had_work: AtomicBool,
}

/// Decrements `in_flight` even when the task is aborted.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolContext {
    fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        if let Err(err) = self.events.emit(event) {
            // push mode has no caller to hand this to
            tracing::warn!(queue = %self.shared.queue, event = %kind, error = %err, "event listener failed");
        }
    }

    fn report_backend_error(&self, err: &QueueError) {
        tracing::warn!(queue = %self.shared.queue, error = %err, "backend operation failed");
        self.emit(QueueEvent::queue_error(
            &self.shared.queue,
            err.info(),
            None,
            self.shared.clock.now(),
        ));
    }

    fn track(&self, token: &LeaseToken) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.insert(token.lease_id(), token.clone());
        }
    }

    fn untrack(&self, token: &LeaseToken) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.remove(&token.lease_id());
        }
    }

    fn held_leases(&self) -> Vec<LeaseToken> {
        self.leases
            .lock()
            .map(|mut leases| leases.drain().map(|(_, token)| token).collect())
            .unwrap_or_default()
    }

    /// Edge-triggered: one `queue.drained` per burst of work.
    async fn maybe_drained(&self) {
        if !self.had_work.load(Ordering::SeqCst) || self.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        if self.shared.waiting().await != Some(0) {
            return;
        }
        if self.had_work.swap(false, Ordering::SeqCst) {
            self.emit(QueueEvent::QueueDrained {
                queue: self.shared.queue.clone(),
                timestamp: self.shared.clock.now(),
            });
        }
    }

    /// `_slot` was taken before checkout and is held until the job is final.
    async fn run(&self, active: ActiveJob, _slot: InFlightGuard<'_>) {
        let token = active.token().clone();
        self.track(&token);
        self.emit(QueueEvent::active(&active.job, self.shared.clock.now()));

        let job = active.job;
        let job_id = job.id.clone();
        let result = AssertUnwindSafe(self.handler.handle(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobFailure::new(panic_message(panic.as_ref()))));

        match result {
            Ok(value) => match self.shared.complete(&token, value.clone()).await {
                Ok(done) => self.emit(QueueEvent::completed(&done, value, self.shared.clock.now())),
                Err(err) => self.report_backend_error(&err),
            },
            Err(failure) => {
                let error = self.shared.mapper.map_failure(&failure);
                tracing::debug!(queue = %self.shared.queue, job_id = %job_id, error = %error, "job failed");
                if let Some(on_error) = &self.on_error {
                    on_error(&error);
                }
                match self.shared.fail(&token, &failure).await {
                    Ok(outcome) => self.emit(QueueEvent::after_nack(
                        &self.shared.queue,
                        &job_id,
                        &outcome,
                        error.info(),
                        self.shared.clock.now(),
                    )),
                    Err(err) => self.report_backend_error(&err),
                }
            }
        }

        self.untrack(&token);
        self.had_work.store(true, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("handler panicked: {detail}"),
        None => "handler panicked".to_string(),
    }
}

/// Pool teardown state. Guarded so `shutdown` runs once.
struct Teardown {
    joins: Vec<JoinHandle<()>>,
    outcome: Option<ShutdownOutcome>,
}

/// Handle of a running pool.
/// - `shutdown_tx` を drop するとワーカー全体が止まる
pub(super) struct MemoryProcessor {
    ctx: Arc<PoolContext>,
    shutdown_tx: watch::Sender<bool>,
    concurrency: usize,
    default_timeout: Duration,
    teardown: Mutex<Teardown>,
}

impl MemoryProcessor {
    /// Spawn `options.concurrency` workers.
    pub(super) fn spawn(
        shared: Arc<Shared>,
        handler: Arc<dyn JobHandler>,
        options: ProcessOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(PoolContext {
            shared: Arc::clone(&shared),
            handler,
            events,
            on_error: options.on_error.clone(),
            in_flight: AtomicUsize::new(0),
            leases: StdMutex::new(HashMap::new()),
            had_work: AtomicBool::new(false),
        });

        let n = options.concurrency;
        shared.active_workers.fetch_add(n, Ordering::SeqCst);
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctx = Arc::clone(&ctx);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx, &mut rx).await;
            }));
        }
        tracing::info!(queue = %shared.queue, concurrency = n, "processor started");

        Self {
            ctx,
            shutdown_tx,
            concurrency: n,
            default_timeout: options.shutdown_timeout,
            teardown: Mutex::new(Teardown {
                joins,
                outcome: None,
            }),
        }
    }

    fn timed_out(&self, budget: Duration, abandoned: usize) -> ShutdownOutcome {
        tracing::warn!(
            queue = %self.ctx.shared.queue,
            abandoned,
            timeout_ms = budget.as_millis() as u64,
            "processor shutdown timed out"
        );
        self.ctx.emit(QueueEvent::ProcessorShutdownTimeout {
            queue: self.ctx.shared.queue.clone(),
            timeout_ms: budget.as_millis().min(u64::MAX as u128) as u64,
            abandoned,
            timestamp: self.ctx.shared.clock.now(),
        });
        ShutdownOutcome::TimedOut { abandoned }
    }
}

#[async_trait]
impl ProcessorHandle for MemoryProcessor {
    async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownOutcome {
        let mut teardown = self.teardown.lock().await;
        if let Some(outcome) = teardown.outcome {
            return outcome;
        }

        let in_flight = self.in_flight();
        tracing::info!(queue = %self.ctx.shared.queue, in_flight, "processor shutting down");
        self.ctx.emit(QueueEvent::ProcessorShuttingDown {
            queue: self.ctx.shared.queue.clone(),
            in_flight,
            timestamp: self.ctx.shared.clock.now(),
        });
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);

        let joins = std::mem::take(&mut teardown.joins);
        let aborts: Vec<_> = joins.iter().map(JoinHandle::abort_handle).collect();
        let budget = timeout.unwrap_or(self.default_timeout);

        let drain = join_all(joins);
        tokio::pin!(drain);
        let outcome = match tokio::time::timeout(budget, drain.as_mut()).await {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                // a task mid-poll finishes that poll before it is cancelled
                if tokio::time::timeout(ABORT_GRACE, drain.as_mut()).await.is_err() {
                    tracing::warn!(queue = %self.ctx.shared.queue, "aborted workers did not stop in time");
                }
                let held = self.ctx.held_leases();
                for token in &held {
                    self.ctx.shared.release_abandoned(token).await;
                }
                self.timed_out(budget, held.len())
            }
        };

        self.ctx
            .shared
            .active_workers
            .fetch_sub(self.concurrency, Ordering::SeqCst);
        teardown.outcome = Some(outcome);
        outcome
    }

    fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    fn in_flight(&self) -> usize {
        self.ctx.in_flight.load(Ordering::SeqCst)
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<PoolContext>, shutdown_rx: &mut watch::Receiver<bool>) {
    let shared = Arc::clone(&ctx.shared);
    let mut paused_rx = shared.paused.subscribe();

    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // pause 中は resume か shutdown まで待つ
        if *paused_rx.borrow_and_update() {
            tokio::select! {
                changed = shutdown_rx.changed() => if changed.is_err() { break },
                _ = paused_rx.changed() => {}
            }
            continue;
        }

        // checkout の前に登録しておくと add の通知を取りこぼさない
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // slot を先に確保: checkout 直後の job も in-flight として数える
        let slot = InFlightGuard::enter(&ctx.in_flight);
        let next = match shared.checkout(1).await {
            Ok(mut jobs) => jobs.pop(),
            Err(err) => {
                drop(slot);
                ctx.report_backend_error(&err);
                if err.code() == Some(ConfigurationCode::QueueNotFound.as_str()) {
                    tracing::info!(worker_id, queue = %shared.queue, "queue deleted, worker exiting");
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => if changed.is_err() { break },
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
                continue;
            }
        };

        let Some(active) = next else {
            drop(slot);
            ctx.maybe_drained().await;
            tokio::select! {
                changed = shutdown_rx.changed() => if changed.is_err() { break },
                _ = paused_rx.changed() => {}
                _ = shared.idle(notified) => {}
            }
            continue;
        };

        tracing::trace!(worker_id, job_id = %active.id(), "job checked out");
        ctx.run(active, slot).await;
    }
    tracing::debug!(worker_id, queue = %shared.queue, "worker stopped");
}
