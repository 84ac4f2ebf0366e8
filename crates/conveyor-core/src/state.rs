// ── Listen state ──

use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::watch;
use tracing::debug;

use crate::error::CoreError;

/// Controller lifecycle state.
///
/// `Closed → Ready → Listening → (Refresh → Ready → Listening)* → Closed`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenState {
    #[default]
    Closed,
    Refresh,
    Ready,
    Listening,
}

impl ListenState {
    /// Whether the lifecycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ListenState::{Closed, Listening, Ready, Refresh};

        match (self, next) {
            (_, Closed) | (Closed, Ready) | (Ready, Listening) | (Refresh, Ready) => true,
            (from, Refresh) => from != Closed,
            _ => self == next,
        }
    }
}

/// Single source of truth for a controller's `ListenState`, observable
/// through `watch` receivers.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ListenState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ListenState::Closed);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ListenState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ListenState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the lifecycle allows it from the current state.
    /// Returns the state that was replaced.
    pub(crate) fn transition(
        &self,
        next: ListenState,
        operation: &'static str,
    ) -> Result<ListenState, CoreError> {
        let mut previous = next;
        let mut allowed = true;
        self.tx.send_if_modified(|state| {
            previous = *state;
            allowed = state.can_transition_to(next);
            if allowed && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if !allowed {
            return Err(CoreError::InvalidState {
                operation,
                state: previous,
            });
        }
        if previous != next {
            debug!(from = %previous, to = %next, "listen state changed");
        }
        Ok(previous)
    }

    /// Move to `next` only if the state is still `expected`.
    pub(crate) fn compare_and_set(&self, expected: ListenState, next: ListenState) -> bool {
        let swapped = self.tx.send_if_modified(|state| {
            if *state == expected && expected != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if swapped {
            debug!(from = %expected, to = %next, "listen state changed");
        }
        swapped
    }
}
