// ── Sequential controller ──
//
// Blocking execution model: `start` runs the listen loop on the calling
// thread until another thread (or a handler) calls `stop`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use conveyor_client::{ClientMap, ClientRegistry};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use super::{
    Listenable, Outcome, Receipt, panic_message, report_outcome, report_received,
    report_unroutable,
};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::message::Message;
use crate::queue::{MessageQueue, Priority, QueueFull};
use crate::routing::{HandlerContext, SyncEventMap};
use crate::state::{ListenState, StateCell};
use crate::stats::{DispatchStats, StatsSnapshot};

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

fn in_handler() -> bool {
    IN_HANDLER.with(Cell::get)
}

/// Marks the current thread as running a handler until dropped.
struct HandlerScope;

impl HandlerScope {
    fn enter() -> Self {
        IN_HANDLER.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(false));
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event-consumption controller for the blocking model.
///
/// Cheaply cloneable; clones share the same queue, clients and state, so
/// one clone can run [`start`](Self::start) while others enqueue messages
/// or call [`stop`](Self::stop) / [`refresh`](Self::refresh).
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    clients: ClientMap,
    queue: Arc<MessageQueue>,
    events: SyncEventMap,
    context: HandlerContext,
    state: StateCell,
    stats: DispatchStats,
    /// Serializes start's prerun, refresh and stop.
    lifecycle: Mutex<()>,
    /// Held while one message is pulled and dispatched.
    dispatch: Mutex<()>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("clients", &self.inner.clients)
            .field("events", &self.inner.events)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Build the client map from `registry` and the configured settings.
    /// Fails on any invalid client parameter; nothing is connected yet.
    pub fn new(
        config: ControllerConfig,
        registry: &ClientRegistry,
        events: SyncEventMap,
    ) -> Result<Self, CoreError> {
        let clients = registry.build(&config.settings)?;
        let queue = Arc::new(MessageQueue::new(config.queue_capacity));
        let context = HandlerContext::new(clients.clone());

        debug!(
            clients = clients.len(),
            events = events.len(),
            capacity = ?config.queue_capacity,
            "controller constructed"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                clients,
                queue,
                events,
                context,
                state: StateCell::new(),
                stats: DispatchStats::default(),
                lifecycle: Mutex::new(()),
                dispatch: Mutex::new(()),
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

    /// Enqueue, blocking while the queue is full.
    pub fn enqueue(&self, message: Message, priority: Priority) {
        self.inner.queue.push_with_priority(message, priority);
    }

    pub fn try_enqueue(&self, message: Message, priority: Priority) -> Result<(), QueueFull> {
        self.inner.queue.try_push_with_priority(message, priority)
    }

    // ── Client lifecycle ─────────────────────────────────────────

    /// Connect every client in declaration order. Leaves the listen state
    /// alone.
    pub fn connect(&self) -> Result<(), CoreError> {
        Ok(self.inner.clients.connect_all()?)
    }

    /// Close every client. Leaves the listen state alone.
    pub fn close(&self) -> Result<(), CoreError> {
        Ok(self.inner.clients.close_all()?)
    }

    // ── Controller lifecycle ─────────────────────────────────────

    /// Connect all clients, then run the listen loop on this thread until
    /// the controller is stopped.
    pub fn start(&self) -> Result<(), CoreError> {
        {
            let _lifecycle = lock(&self.inner.lifecycle);
            let state = self.state();
            if state != ListenState::Closed {
                return Err(CoreError::InvalidState {
                    operation: "start",
                    state,
                });
            }
            self.prerun()?;
        }
        self.listen()
    }

    /// Move to CLOSED and close all clients, waiting for an in-flight
    /// handler first. Safe from any state and from inside a handler.
    pub fn stop(&self) -> Result<(), CoreError> {
        let nested = in_handler();
        let _lifecycle = (!nested).then(|| lock(&self.inner.lifecycle));
        let previous = self.inner.state.transition(ListenState::Closed, "stop")?;
        let _gate = (!nested).then(|| lock(&self.inner.dispatch));

        info!(from = %previous, "stopping controller");
        self.postrun()
    }

    /// Close and reconnect every client without losing queued messages.
    ///
    /// Dispatch pauses while the state is REFRESH. On failure the
    /// controller stays in REFRESH so the caller can retry or stop.
    pub fn refresh(&self) -> Result<(), CoreError> {
        let nested = in_handler();
        let _lifecycle = (!nested).then(|| lock(&self.inner.lifecycle));
        self.inner.state.transition(ListenState::Refresh, "refresh")?;
        let _gate = (!nested).then(|| lock(&self.inner.dispatch));

        // a nested stop may have won while we waited for the gate
        let state = self.state();
        if state != ListenState::Refresh {
            return Err(CoreError::InvalidState {
                operation: "refresh",
                state,
            });
        }

        info!("refreshing client connections");
        self.close().inspect_err(|err| {
            error!(error = %err, "close during refresh failed, controller stays in REFRESH");
        })?;
        self.connect().inspect_err(|err| {
            error!(error = %err, "refresh failed, controller stays in REFRESH");
        })?;

        self.inner
            .state
            .compare_and_set(ListenState::Refresh, ListenState::Ready);
        info!("refresh complete");
        Ok(())
    }

    /// Run the listen loop until the controller is CLOSED.
    pub fn listen(&self) -> Result<(), CoreError> {
        if self.state() == ListenState::Closed {
            debug!("listen called on a closed controller, ignoring");
            return Ok(());
        }

        info!(events = self.inner.events.len(), "listening");
        loop {
            match self.state() {
                ListenState::Closed => break,
                ListenState::Refresh => thread::sleep(self.inner.config.refresh_backoff),
                ListenState::Ready => {
                    self.inner
                        .state
                        .compare_and_set(ListenState::Ready, ListenState::Listening);
                }
                ListenState::Listening => {
                    if !self.step() {
                        thread::sleep(self.inner.config.idle_backoff);
                    }
                }
            }
        }
        info!(stats = ?self.stats(), "listen loop exited");
        Ok(())
    }

    fn prerun(&self) -> Result<(), CoreError> {
        if let Err(err) = self.connect() {
            error!(error = %err, "prerun failed, closing clients");
            if let Err(close_err) = self.inner.clients.close_all() {
                warn!(error = %close_err, "cleanup after failed prerun also failed");
            }
            return Err(err);
        }
        self.inner.state.transition(ListenState::Ready, "start")?;
        info!(clients = self.inner.clients.len(), "controller ready");
        Ok(())
    }

    fn postrun(&self) -> Result<(), CoreError> {
        let result = self.close();
        info!(stats = ?self.stats(), "controller stopped");
        result
    }

    /// Pull and dispatch one message. Returns `false` when the queue was
    /// empty.
    fn step(&self) -> bool {
        let _gate = lock(&self.inner.dispatch);
        if self.state() != ListenState::Listening {
            return true;
        }
        let Some(message) = self.inner.queue.pull() else {
            return false;
        };
        self.dispatch(&message);
        true
    }

    fn dispatch(&self, message: &Message) {
        let receipt = Receipt::of(message);
        let stats = &self.inner.stats;

        let handler = match self.inner.events.resolve(&message.channel) {
            Ok(handler) => handler,
            Err(err) => {
                stats.record_received();
                report_unroutable(stats, &receipt, &err);
                return;
            }
        };
        report_received(stats, &receipt);

        let started = Instant::now();
        let result = {
            let _scope = HandlerScope::enter();
            panic::catch_unwind(AssertUnwindSafe(|| handler(&self.inner.context, message)))
        };
        let outcome = match result {
            Ok(Ok(())) => Outcome::Handled,
            Ok(Err(err)) => Outcome::Failed(err),
            Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
        };
        report_outcome(stats, &receipt, outcome, started.elapsed());
    }
}

impl Listenable for Controller {
    fn listen(&self) -> Result<(), CoreError> {
        Controller::listen(self)
    }

    fn listen_state(&self) -> ListenState {
        self.state()
    }
}
