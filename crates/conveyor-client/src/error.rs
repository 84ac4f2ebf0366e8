use thiserror::Error;

/// Boxed error returned by backend drivers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for the `conveyor-client` crate.
///
/// Covers every failure mode of a client's life: parameter validation at
/// construction, connection setup and teardown, statement execution, and
/// registry lookups. `conveyor-core` maps these into controller errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Configuration ───────────────────────────────────────────────
    /// A parameter failed type coercion or its validator.
    #[error("invalid value for parameter {parameter}: {reason}")]
    Validation { parameter: String, reason: String },

    /// A required parameter has no value in the settings and no default.
    #[error("missing required parameter {parameter}")]
    MissingParameter { parameter: String },

    // ── Connection lifecycle ────────────────────────────────────────
    /// The backend failed to open a connection.
    #[error("failed connecting to host {client} ({kind}): {source}")]
    Connect {
        client: String,
        kind: &'static str,
        #[source]
        source: BoxError,
    },

    /// The backend failed to release a connection. The client is CLOSED
    /// regardless.
    #[error("failed disconnecting from {client} ({kind}): {source}")]
    Close {
        client: String,
        kind: &'static str,
        #[source]
        source: BoxError,
    },

    // ── Execution ───────────────────────────────────────────────────
    /// A statement or commit failed on an open connection.
    #[error("execution failed on {client}: {source}")]
    Execute {
        client: String,
        #[source]
        source: BoxError,
    },

    /// Query parameters could not be built from the given JSON value.
    #[error("invalid query parameters: {0}")]
    InvalidQueryParams(String),

    /// A fetch mode string did not name NONE, ONE or ALL.
    #[error("unknown fetch mode '{0}' (expected none, one or all)")]
    UnknownFetchMode(String),

    // ── Registry ────────────────────────────────────────────────────
    /// Lookup of a client name that was never declared.
    #[error("client map has no client named {name:?}")]
    UnknownClient { name: String },

    /// A client exists under this name but is a different concrete type.
    #[error("client {name:?} is not a {expected}")]
    WrongClientType { name: String, expected: &'static str },

    /// Two registrations used the same logical name.
    #[error("client {name:?} is declared more than once")]
    DuplicateClient { name: String },
}

impl Error {
    /// Returns `true` if this error was raised while validating configuration,
    /// before any connection attempt.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::MissingParameter { .. })
    }

    /// Returns `true` if this error came from opening or releasing a
    /// connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Close { .. })
    }

    /// Name of the client involved, if the error is tied to one.
    pub fn client_name(&self) -> Option<&str> {
        match self {
            Self::Connect { client, .. }
            | Self::Close { client, .. }
            | Self::Execute { client, .. } => Some(client),
            Self::UnknownClient { name }
            | Self::WrongClientType { name, .. }
            | Self::DuplicateClient { name } => Some(name),
            _ => None,
        }
    }
}
