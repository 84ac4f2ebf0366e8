//! Subcommand handlers.

pub mod check;
pub mod config_cmd;
pub mod run;

use std::path::PathBuf;

use conveyor_config::{Config, config_path, load_config};

use crate::cli::GlobalOpts;
use crate::error::CliError;

// ── Shared helpers ──────────────────────────────────────────────────

/// `--config` / `CONVEYOR_CONFIG`, else the platform default.
pub fn resolved_config_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config_path)
}

/// Load the config; an explicitly requested file must exist.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = resolved_config_path(global);
    if global.config.is_some() && !path.exists() {
        return Err(CliError::config(&path, "file does not exist"));
    }
    load_config(&path).map_err(|err| match CliError::from(err) {
        CliError::Config { source, .. } => CliError::Config {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}
