// ── Core error types ──
//
// Errors surfaced by the controller. Client-layer failures are translated
// by the `From<conveyor_client::Error>` impl so consumers match on one
// taxonomy. Handler failures are counted by the dispatch loop, not raised.

use thiserror::Error;

use crate::state::ListenState;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("failed connecting to host {client}: {reason}")]
    ConnectionFailed { client: String, reason: String },

    #[error("Client not found: {name}")]
    ClientNotFound { name: String },

    #[error("Execution failed on {client}: {message}")]
    Execution { client: String, message: String },

    // ── Dispatch errors ──────────────────────────────────────────────
    #[error("no handler for event '{event}' (channel {channel})")]
    Routing { channel: String, event: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("cannot {operation} while controller is {state}")]
    InvalidState {
        operation: &'static str,
        state: ListenState,
    },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationFailed { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }
}

// ── Conversion from client-layer errors ──────────────────────────────

impl From<conveyor_client::Error> for CoreError {
    fn from(err: conveyor_client::Error) -> Self {
        use conveyor_client::Error as E;

        match err {
            E::Validation { .. }
            | E::MissingParameter { .. }
            | E::InvalidQueryParams(_)
            | E::UnknownFetchMode(_) => Self::ValidationFailed {
                message: err.to_string(),
            },
            E::Connect { client, source, .. } | E::Close { client, source, .. } => {
                Self::ConnectionFailed {
                    client,
                    reason: source.to_string(),
                }
            }
            E::Execute { client, source } => Self::Execution {
                client,
                message: source.to_string(),
            },
            E::UnknownClient { name } => Self::ClientNotFound { name },
            E::WrongClientType { .. } | E::DuplicateClient { .. } => Self::Config {
                message: err.to_string(),
            },
        }
    }
}
