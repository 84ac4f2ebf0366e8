//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with stable
//! exit codes.

use miette::Diagnostic;
use thiserror::Error;

use conveyor_config::ConfigError;
use conveyor_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const VALIDATION: i32 = 3;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(conveyor::config),
        help("Check the TOML syntax and any CONVEYOR_<SECTION>__<KEY> variables.")
    )]
    Config {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(
        code(conveyor::validation),
        help("Run `conveyor check` to validate the configuration.")
    )]
    Validation { field: String, reason: String },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error("Could not connect client '{client}'")]
    #[diagnostic(
        code(conveyor::connection_failed),
        help("Check the client's settings and that the target is reachable.")
    )]
    ConnectionFailed {
        client: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Controller error: {0}")]
    #[diagnostic(code(conveyor::controller))]
    Controller(CoreError),

    #[error("Failed to render output: {reason}")]
    #[diagnostic(code(conveyor::render))]
    Render { reason: String },

    // ── IO ───────────────────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::Validation { .. } => exit_code::VALIDATION,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            _ => exit_code::GENERAL,
        }
    }

    pub fn config(path: &std::path::Path, source: impl std::fmt::Display) -> Self {
        Self::Config {
            path: path.display().to_string(),
            source: source.to_string().into(),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { client, reason } => Self::ConnectionFailed {
                client,
                source: reason.into(),
            },
            CoreError::ValidationFailed { message } => Self::Validation {
                field: "settings".into(),
                reason: message,
            },
            CoreError::Config { message } => Self::Config {
                path: "(settings)".into(),
                source: message.into(),
            },
            other => Self::Controller(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::Client(err) => CoreError::from(err).into(),
            ConfigError::Controller(err) => err.into(),
            ConfigError::Io(err) => Self::Io(err),
            other @ (ConfigError::Figment(_) | ConfigError::Serialization(_)) => Self::Config {
                path: "(config)".into(),
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        let validation = CliError::from(ConfigError::Validation {
            field: "controller.idle_backoff".into(),
            reason: "nope".into(),
        });
        assert_eq!(validation.exit_code(), 3);

        let connection = CliError::from(CoreError::ConnectionFailed {
            client: "db".into(),
            reason: "refused".into(),
        });
        assert_eq!(connection.exit_code(), 7);

        let missing = CliError::from(ConfigError::Client(
            conveyor_client::Error::MissingParameter {
                parameter: "DB_PATH".into(),
            },
        ));
        assert_eq!(missing.exit_code(), 3);

        let internal = CliError::from(CoreError::Internal("boom".into()));
        assert_eq!(internal.exit_code(), 1);
    }
}
