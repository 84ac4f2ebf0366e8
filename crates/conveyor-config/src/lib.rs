//! Configuration for the conveyor binary.
//!
//! A TOML file merged with `CONVEYOR_<SECTION>__<KEY>` environment
//! variables (via figment), translated into a
//! [`ControllerConfig`](conveyor_core::ControllerConfig) and a
//! [`ClientRegistry`](conveyor_client::ClientRegistry).
//!
//! ```toml
//! [controller]
//! mode = "cooperative"
//! queue_max_size = 1000
//! idle_backoff = "250ms"
//!
//! [clients.db]
//! kind = "sqlite"
//! path = "/var/lib/conveyor/app.db"   # becomes DB_PATH
//!
//! [settings]
//! DB_BUSY_TIMEOUT_MS = 2000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use conveyor_client::{ClientRegistry, Settings};
use conveyor_core::{ControllerConfig, CoreError};

/// Prefix for environment overrides; sections and keys are split on `__`.
pub const ENV_PREFIX: &str = "CONVEYOR_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error(transparent)]
    Client(#[from] conveyor_client::Error),

    #[error(transparent)]
    Controller(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    /// Whether the file parsed but a value was rejected.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation { .. } => true,
            Self::Client(err) => err.is_validation(),
            Self::Controller(err) => err.is_validation(),
            _ => false,
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,

    /// Declared clients by logical name.
    #[serde(default)]
    pub clients: BTreeMap<String, ClientDecl>,

    /// Raw settings handed to every client constructor.
    #[serde(default)]
    pub settings: Settings,
}

/// Which controller runs the listen loop.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Mode {
    /// Blocking loop on a dedicated thread.
    #[default]
    Sync,
    /// Async loop on the tokio runtime.
    Cooperative,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ControllerSection {
    #[serde(default)]
    pub mode: Mode,

    /// 0 means unbounded.
    pub queue_max_size: Option<usize>,

    /// humantime duration, e.g. `"500ms"`.
    pub idle_backoff: Option<String>,

    pub refresh_backoff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClientKind {
    Sqlite,
    Host,
}

/// A `[clients.<name>]` table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientDecl {
    pub kind: ClientKind,

    /// Remaining keys, stored as `<NAME>_<KEY>` settings.
    #[serde(flatten)]
    pub params: Settings,
}

impl ClientDecl {
    pub fn new(kind: ClientKind) -> Self {
        Self {
            kind,
            params: Settings::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key, value);
        self
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "conveyor", "conveyor").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("conveyor");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the file at `path` (if any), then the environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate the config. A missing file yields the defaults plus
/// whatever the environment provides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), exists = path.exists(), "loading config");
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, cfg.to_toml()?)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check everything that does not need the client parameter maps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.clients.keys() {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::Validation {
                    field: format!("clients.{name}"),
                    reason: "client names may only contain letters, digits and '_'".into(),
                });
            }
        }
        self.idle_backoff()?;
        self.refresh_backoff()?;
        Ok(())
    }

    /// `[settings]` plus every client table's keys under its name prefix.
    /// Client tables win on conflicts.
    pub fn settings(&self) -> Settings {
        let mut settings = self.settings.clone();
        for (name, decl) in &self.clients {
            for (key, value) in decl.params.iter() {
                settings.insert(format!("{name}_{key}"), value.clone());
            }
        }
        settings
    }

    pub fn idle_backoff(&self) -> Result<Option<Duration>, ConfigError> {
        parse_backoff("controller.idle_backoff", self.controller.idle_backoff.as_deref())
    }

    pub fn refresh_backoff(&self) -> Result<Option<Duration>, ConfigError> {
        parse_backoff(
            "controller.refresh_backoff",
            self.controller.refresh_backoff.as_deref(),
        )
    }

    /// `ControllerConfig::from_settings` over the merged settings, with the
    /// `[controller]` section taking precedence.
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let mut config = ControllerConfig::from_settings(self.settings())?;
        if let Some(size) = self.controller.queue_max_size {
            config = config.with_queue_capacity(Some(size));
        }
        if let Some(backoff) = self.idle_backoff()? {
            config = config.with_idle_backoff(backoff);
        }
        if let Some(backoff) = self.refresh_backoff()? {
            config = config.with_refresh_backoff(backoff);
        }
        Ok(config)
    }

    /// One registry entry per `[clients.<name>]` table.
    pub fn client_registry(&self) -> Result<ClientRegistry, ConfigError> {
        let mut registry = ClientRegistry::new();
        for (name, decl) in &self.clients {
            match decl.kind {
                ClientKind::Sqlite => registry.sqlite(name)?,
                ClientKind::Host => registry.host(name)?,
            };
        }
        debug!(clients = registry.len(), "client registry built from config");
        Ok(registry)
    }
}

fn parse_backoff(field: &str, raw: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    raw.map(|s| {
        humantime::parse_duration(s).map_err(|e| ConfigError::Validation {
            field: field.into(),
            reason: format!("'{s}' is not a duration: {e}"),
        })
    })
    .transpose()
}
