// ── Cooperative controller ──
//
// Async execution model. The listen loop is a future; each handler call
// runs as its own tokio task so a panic is contained by its JoinHandle.
// Blocking client I/O (connect/close) goes through `spawn_blocking`, and
// every backoff races the run's cancellation token.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use conveyor_client::{ClientMap, ClientRegistry};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AsyncListenable, Outcome, Receipt, panic_message, report_outcome, report_received,
    report_unroutable,
};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::message::Message;
use crate::queue::{MessageQueue, Priority, QueueFull};
use crate::routing::{AsyncEventMap, HandlerContext};
use crate::state::{ListenState, StateCell};
use crate::stats::{DispatchStats, StatsSnapshot};

tokio::task_local! {
    static IN_HANDLER: ();
}

fn in_handler() -> bool {
    IN_HANDLER.try_with(|_| ()).is_ok()
}

/// Event-consumption controller for the cooperative model.
///
/// Cheaply cloneable via `Arc<AsyncInner>`.
#[derive(Clone)]
pub struct AsyncController {
    inner: Arc<AsyncInner>,
}

struct AsyncInner {
    config: ControllerConfig,
    clients: ClientMap,
    queue: Arc<MessageQueue>,
    events: AsyncEventMap,
    context: HandlerContext,
    state: StateCell,
    stats: DispatchStats,
    lifecycle: AsyncMutex<()>,
    dispatch: AsyncMutex<()>,
    /// Cancelled by `stop`, replaced by a fresh token for the next run.
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for AsyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncController")
            .field("state", &self.state())
            .field("clients", &self.inner.clients)
            .field("events", &self.inner.events)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl AsyncController {
    /// Build the client map from `registry` and the configured settings.
    /// Does NOT connect; call [`start`](Self::start).
    pub fn new(
        config: ControllerConfig,
        registry: &ClientRegistry,
        events: AsyncEventMap,
    ) -> Result<Self, CoreError> {
        let clients = registry.build(&config.settings)?;
        let queue = Arc::new(MessageQueue::new(config.queue_capacity));
        let context = HandlerContext::new(clients.clone());

        debug!(
            clients = clients.len(),
            events = events.len(),
            capacity = ?config.queue_capacity,
            "async controller constructed"
        );

        Ok(Self {
            inner: Arc::new(AsyncInner {
                config,
                clients,
                queue,
                events,
                context,
                state: StateCell::new(),
                stats: DispatchStats::default(),
                lifecycle: AsyncMutex::new(()),
                dispatch: AsyncMutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn clients(&self) -> &ClientMap {
        &self.inner.clients
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.inner.queue
    }

    pub fn state(&self) -> ListenState {
        self.inner.state.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    // ── State observation ────────────────────────────────────────

    pub fn subscribe_state(&self) -> watch::Receiver<ListenState> {
        self.inner.state.subscribe()
    }

    pub fn state_stream(&self) -> WatchStream<ListenState> {
        WatchStream::new(self.subscribe_state())
    }

    // ── Producers ────────────────────────────────────────────────

    /// Enqueue, suspending while the queue is full.
    pub async fn enqueue(&self, message: Message, priority: Priority) {
        self.inner.queue.apush_with_priority(message, priority).await;
    }

    pub fn try_enqueue(&self, message: Message, priority: Priority) -> Result<(), QueueFull> {
        self.inner.queue.try_push_with_priority(message, priority)
    }

    /// Enqueue `message` once `delay` has elapsed.
    ///
    /// The pending enqueue is dropped if the controller is stopped first.
    /// Must be called from within a tokio runtime.
    pub fn enqueue_after(
        &self,
        message: Message,
        priority: Priority,
        delay: Duration,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.inner.queue);
        let cancel = self.token();
        let id = message.id;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => debug!(%id, "delayed enqueue dropped on stop"),
                () = async {
                    tokio::time::sleep(delay).await;
                    queue.apush_with_priority(message, priority).await;
                } => debug!(%id, priority, "delayed message enqueued"),
            }
        })
    }

    // ── Client lifecycle ─────────────────────────────────────────

    /// Connect every client on the blocking pool. Leaves the listen state
    /// alone.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let clients = self.inner.clients.clone();
        tokio::task::spawn_blocking(move || clients.connect_all())
            .await
            .map_err(|e| CoreError::Internal(format!("connect task failed: {e}")))??;
        Ok(())
    }

    /// Close every client on the blocking pool. Leaves the listen state
    /// alone.
    pub async fn close(&self) -> Result<(), CoreError> {
        let clients = self.inner.clients.clone();
        tokio::task::spawn_blocking(move || clients.close_all())
            .await
            .map_err(|e| CoreError::Internal(format!("close task failed: {e}")))??;
        Ok(())
    }

    // ── Controller lifecycle ─────────────────────────────────────

    /// Connect all clients, then run the listen loop until stopped.
    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            let state = self.state();
            if state != ListenState::Closed {
                return Err(CoreError::InvalidState {
                    operation: "start",
                    state,
                });
            }
            self.prerun().await?;
        }
        self.listen().await
    }

    /// Move to CLOSED, cancel pending backoffs and delayed enqueues, wait
    /// for an in-flight handler, then close all clients.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let nested = in_handler();
        let _lifecycle = if nested {
            None
        } else {
            Some(self.inner.lifecycle.lock().await)
        };
        let previous = self.inner.state.transition(ListenState::Closed, "stop")?;
        self.rotate_token();
        let _gate = if nested {
            None
        } else {
            Some(self.inner.dispatch.lock().await)
        };

        info!(from = %previous, "stopping controller");
        self.postrun().await
    }

    /// Close and reconnect every client without losing queued messages.
    ///
    /// On failure the controller stays in REFRESH so the caller can retry
    /// or stop.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let nested = in_handler();
        let _lifecycle = if nested {
            None
        } else {
            Some(self.inner.lifecycle.lock().await)
        };
        self.inner.state.transition(ListenState::Refresh, "refresh")?;
        let _gate = if nested {
            None
        } else {
            Some(self.inner.dispatch.lock().await)
        };

        // a nested stop may have won while we waited for the gate
        let state = self.state();
        if state != ListenState::Refresh {
            return Err(CoreError::InvalidState {
                operation: "refresh",
                state,
            });
        }

        info!("refreshing client connections");
        self.close().await.inspect_err(|err| {
            error!(error = %err, "close during refresh failed, controller stays in REFRESH");
        })?;
        self.connect().await.inspect_err(|err| {
            error!(error = %err, "refresh failed, controller stays in REFRESH");
        })?;

        self.inner
            .state
            .compare_and_set(ListenState::Refresh, ListenState::Ready);
        info!("refresh complete");
        Ok(())
    }

    /// Run the listen loop until the controller is CLOSED.
    pub async fn listen(&self) -> Result<(), CoreError> {
        if self.state() == ListenState::Closed {
            debug!("listen called on a closed controller, ignoring");
            return Ok(());
        }

        let cancel = self.token();
        let config = &self.inner.config;
        info!(events = self.inner.events.len(), "listening");
        loop {
            match self.state() {
                ListenState::Closed => break,
                ListenState::Refresh => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(config.refresh_backoff) => {}
                    }
                }
                ListenState::Ready => {
                    self.inner
                        .state
                        .compare_and_set(ListenState::Ready, ListenState::Listening);
                }
                ListenState::Listening => {
                    if self.step().await {
                        continue;
                    }
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.inner.queue.wait_readable() => {}
                        () = tokio::time::sleep(config.idle_backoff) => {}
                    }
                }
            }
        }
        info!(stats = ?self.stats(), "listen loop exited");
        Ok(())
    }

    fn token(&self) -> CancellationToken {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rotate_token(&self) {
        let old = {
            let mut current = self
                .inner
                .cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        old.cancel();
    }

    async fn prerun(&self) -> Result<(), CoreError> {
        if let Err(err) = self.connect().await {
            error!(error = %err, "prerun failed, closing clients");
            if let Err(close_err) = self.close().await {
                warn!(error = %close_err, "cleanup after failed prerun also failed");
            }
            return Err(err);
        }
        self.inner.state.transition(ListenState::Ready, "start")?;
        info!(clients = self.inner.clients.len(), "controller ready");
        Ok(())
    }

    async fn postrun(&self) -> Result<(), CoreError> {
        let result = self.close().await;
        info!(stats = ?self.stats(), "controller stopped");
        result
    }

    /// Pull and dispatch one message. Returns `false` when the queue was
    /// empty.
    async fn step(&self) -> bool {
        let _gate = self.inner.dispatch.lock().await;
        if self.state() != ListenState::Listening {
            return true;
        }
        let Some(message) = self.inner.queue.pull() else {
            return false;
        };
        self.dispatch(message).await;
        true
    }

    async fn dispatch(&self, message: Message) {
        let receipt = Receipt::of(&message);
        let stats = &self.inner.stats;

        let handler = match self.inner.events.resolve(&message.channel) {
            Ok(handler) => Arc::clone(handler),
            Err(err) => {
                stats.record_received();
                report_unroutable(stats, &receipt, &err);
                return;
            }
        };
        report_received(stats, &receipt);

        let started = Instant::now();
        let ctx = self.inner.context.clone();
        let task = tokio::spawn(IN_HANDLER.scope((), async move { handler(ctx, message).await }));
        let outcome = match task.await {
            Ok(Ok(())) => Outcome::Handled,
            Ok(Err(err)) => Outcome::Failed(err),
            Err(join_err) if join_err.is_panic() => {
                Outcome::Panicked(panic_message(join_err.into_panic().as_ref()))
            }
            Err(join_err) => Outcome::Failed(Box::new(join_err)),
        };
        report_outcome(stats, &receipt, outcome, started.elapsed());
    }
}

impl AsyncListenable for AsyncController {
    async fn listen(&self) -> Result<(), CoreError> {
        AsyncController::listen(self).await
    }

    fn listen_state(&self) -> ListenState {
        self.state()
    }
}
