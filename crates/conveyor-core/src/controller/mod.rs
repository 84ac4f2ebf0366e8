// ── Controllers ──
//
// Two execution models over the same parts (ClientMap, MessageQueue,
// EventMap, ListenState):
//
// - `Controller` runs the listen loop on the calling thread.
// - `AsyncController` runs it as a tokio future and spawns each handler
//   invocation as a task.

mod cooperative;
mod sequential;

pub use cooperative::AsyncController;
pub use sequential::Controller;

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use conveyor_client::BoxError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::message::{Message, event_name};
use crate::state::ListenState;
use crate::stats::DispatchStats;

/// Capability of running a listen loop until the controller closes.
pub trait Listenable {
    /// Run the loop on the current thread. Returns immediately when the
    /// controller is CLOSED.
    fn listen(&self) -> Result<(), CoreError>;

    fn listen_state(&self) -> ListenState;
}

/// [`Listenable`] for the cooperative model.
pub trait AsyncListenable {
    fn listen(&self) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn listen_state(&self) -> ListenState;
}

// ── Dispatch bookkeeping shared by both models ───────────────────

/// Identity of a message being dispatched, kept for logging after the
/// message itself has moved into its handler.
pub(crate) struct Receipt {
    id: Uuid,
    channel: String,
}

impl Receipt {
    pub(crate) fn of(message: &Message) -> Self {
        Self {
            id: message.id,
            channel: message.channel.clone(),
        }
    }

    fn event(&self) -> &str {
        event_name(&self.channel)
    }
}

pub(crate) enum Outcome {
    Handled,
    Failed(BoxError),
    Panicked(String),
}

pub(crate) fn report_unroutable(stats: &DispatchStats, receipt: &Receipt, err: &CoreError) {
    stats.record_unroutable();
    warn!(
        id = %receipt.id,
        channel = %receipt.channel,
        event = receipt.event(),
        error = %err,
        "routing failed, message dropped"
    );
}

pub(crate) fn report_received(stats: &DispatchStats, receipt: &Receipt) {
    stats.record_received();
    info!(
        id = %receipt.id,
        channel = %receipt.channel,
        event = receipt.event(),
        "message received"
    );
}

pub(crate) fn report_outcome(
    stats: &DispatchStats,
    receipt: &Receipt,
    outcome: Outcome,
    elapsed: Duration,
) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match outcome {
        Outcome::Handled => {
            stats.record_dispatched();
            info!(
                id = %receipt.id,
                event = receipt.event(),
                elapsed_ms,
                "message handled"
            );
        }
        Outcome::Failed(err) => {
            stats.record_failed();
            error!(
                id = %receipt.id,
                channel = %receipt.channel,
                event = receipt.event(),
                elapsed_ms,
                error = %err,
                "handler failed"
            );
        }
        Outcome::Panicked(reason) => {
            stats.record_failed();
            error!(
                id = %receipt.id,
                channel = %receipt.channel,
                event = receipt.event(),
                elapsed_ms,
                panic = %reason,
                "handler panicked"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
