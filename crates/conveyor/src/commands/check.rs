//! `conveyor check`: build every client from configuration without
//! connecting, so parameter errors surface before a run.

use std::collections::BTreeMap;

use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use conveyor_client::{Connectable, ConnectState};
use conveyor_core::CoreError;

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct ClientSummary {
    name: String,
    kind: &'static str,
    state: ConnectState,
    params: BTreeMap<String, String>,
}

#[derive(Tabled)]
struct ClientRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Parameters")]
    params: String,
}

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = super::load(global)?;
    let controller = cfg.controller_config()?;
    let clients = cfg
        .client_registry()?
        .build(&controller.settings)
        .map_err(CoreError::from)?;
    info!(clients = clients.len(), "configuration is valid");

    let summaries: Vec<ClientSummary> = clients
        .iter()
        .map(|(name, client)| ClientSummary {
            name: name.to_owned(),
            kind: client.kind(),
            state: client.state(),
            params: client
                .params()
                .iter()
                .map(|(key, value)| (key.to_owned(), value.to_string()))
                .collect(),
        })
        .collect();

    let color = output::should_color(global.color);
    let rendered = output::render_list(
        global.output,
        &summaries,
        |s| ClientRow {
            name: s.name.clone(),
            kind: s.kind.to_owned(),
            state: output::paint_state(s.state, color),
            params: s
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", "),
        },
        |s| s.name.clone(),
    )?;
    output::print_output(&rendered, global.quiet);

    if matches!(global.output, OutputFormat::Table) {
        let queue = controller
            .queue_capacity
            .map_or_else(|| "unbounded".to_owned(), |c| c.to_string());
        output::print_output(
            &format!(
                "mode {} · queue {queue} · idle backoff {:?} · refresh backoff {:?}",
                cfg.controller.mode, controller.idle_backoff, controller.refresh_backoff
            ),
            global.quiet,
        );
    }
    Ok(())
}
