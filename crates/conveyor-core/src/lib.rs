//! Event-consumption engine for conveyor.
//!
//! - **[`MessageQueue`]**: bounded, priority-ordered mailbox. Lower
//!   priority values dequeue first (default [`DEFAULT_PRIORITY`]), ties in
//!   enqueue order. Blocking, non-blocking and async producers share it.
//!
//! - **[`EventMap`]**: static table from event name to handler. A
//!   message's event is its channel with the path-like prefix removed, so
//!   `/db/exec` routes to `exec`.
//!
//! - **[`Controller`] / [`AsyncController`]**: own a
//!   [`ClientMap`](conveyor_client::ClientMap), a queue, an event map and
//!   a [`ListenState`]. `start` connects every client and runs the listen
//!   loop; `refresh` reconnects in place; `stop` closes everything. The
//!   first runs on a thread, the second as a tokio future with each
//!   handler spawned as a task.
//!
//! Handler failures and routing misses are logged and counted in
//! [`StatsSnapshot`]; they never stop the loop.

pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod queue;
pub mod routing;
pub mod state;
pub mod stats;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ControllerConfig;
pub use controller::{AsyncController, AsyncListenable, Controller, Listenable};
pub use error::CoreError;
pub use message::{Message, event_name};
pub use queue::{DEFAULT_PRIORITY, MessageQueue, Priority, QueueFull};
pub use routing::{
    AsyncEventMap, AsyncHandler, EventMap, EventMapBuilder, Handler, HandlerContext,
    HandlerResult, SyncEventMap,
};
pub use state::ListenState;
pub use stats::{DispatchStats, StatsSnapshot};
