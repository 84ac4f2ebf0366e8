//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, ConfigFormat, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            let path = super::resolved_config_path(global);
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show { format } => {
            let cfg = super::load(global)?;
            let rendered = match format {
                ConfigFormat::Toml => cfg.to_toml()?,
                ConfigFormat::Json => output::render_json(&cfg, false)?,
                ConfigFormat::Yaml => output::render_yaml(&cfg)?,
            };
            output::print_output(rendered.trim_end(), global.quiet);
            Ok(())
        }
    }
}
