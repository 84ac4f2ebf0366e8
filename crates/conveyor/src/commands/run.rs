//! `conveyor run`: stream JSON lines into a controller, wait for the
//! queue to drain, then stop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use conveyor_client::ClientRegistry;
use conveyor_config::Mode;
use conveyor_core::{
    AsyncController, Controller, ControllerConfig, CoreError, DEFAULT_PRIORITY, ListenState,
    Message, MessageQueue, Priority, StatsSnapshot,
};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::handlers;

const DRAIN_POLL: Duration = Duration::from_millis(10);

type Runner = JoinHandle<Result<(), CoreError>>;

// ── Engine ───────────────────────────────────────────────────────────

/// Either controller, driven the same way from the async command.
#[derive(Clone)]
enum Engine {
    Sync(Controller),
    Cooperative(AsyncController),
}

impl Engine {
    fn build(
        mode: Mode,
        config: ControllerConfig,
        registry: &ClientRegistry,
    ) -> Result<Self, CoreError> {
        Ok(match mode {
            Mode::Sync => Self::Sync(Controller::new(config, registry, handlers::sync_events())?),
            Mode::Cooperative => Self::Cooperative(AsyncController::new(
                config,
                registry,
                handlers::async_events(),
            )?),
        })
    }

    fn queue(&self) -> Arc<MessageQueue> {
        match self {
            Self::Sync(c) => Arc::clone(c.queue()),
            Self::Cooperative(c) => Arc::clone(c.queue()),
        }
    }

    fn subscribe_state(&self) -> watch::Receiver<ListenState> {
        match self {
            Self::Sync(c) => c.subscribe_state(),
            Self::Cooperative(c) => c.subscribe_state(),
        }
    }

    fn stats(&self) -> StatsSnapshot {
        match self {
            Self::Sync(c) => c.stats(),
            Self::Cooperative(c) => c.stats(),
        }
    }

    /// Start the controller: the blocking loop on the blocking pool, the
    /// cooperative one as a task.
    fn spawn(&self) -> Runner {
        match self.clone() {
            Self::Sync(c) => tokio::task::spawn_blocking(move || c.start()),
            Self::Cooperative(c) => tokio::spawn(async move { c.start().await }),
        }
    }

    async fn stop(&self) -> Result<(), CoreError> {
        match self.clone() {
            Self::Sync(c) => tokio::task::spawn_blocking(move || c.stop())
                .await
                .map_err(|e| CoreError::Internal(format!("stop task failed: {e}")))?,
            Self::Cooperative(c) => c.stop().await,
        }
    }
}

// ── Command ──────────────────────────────────────────────────────────

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = super::load(global)?;
    let mode = args.mode.unwrap_or(cfg.controller.mode);
    let registry = cfg.client_registry()?;
    let engine = Engine::build(mode, cfg.controller_config()?, &registry)?;
    let input = open_input(args.input.as_deref()).await?;

    info!(%mode, clients = registry.len(), "starting controller");
    let mut runner = engine.spawn();

    // Feed only once the clients are connected; a failed start ends here.
    let mut states = engine.subscribe_state();
    tokio::select! {
        finished = &mut runner => return settle(finished),
        _ = states.wait_for(|s| *s != ListenState::Closed) => {}
    }

    let queue = engine.queue();
    let fed = tokio::select! {
        finished = &mut runner => {
            warn!("controller stopped while input was still being read");
            return settle(finished);
        }
        fed = feed(input, &queue) => fed?,
    };

    let drained = async {
        while engine.stats().settled() < fed {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    };
    tokio::select! {
        finished = &mut runner => {
            info!(stats = ?engine.stats(), "controller stopped before the queue drained");
            return settle(finished);
        }
        () = drained => debug!(fed, "queue drained"),
    }

    engine.stop().await?;
    settle(runner.await)?;
    info!(stats = ?engine.stats(), "run complete");
    Ok(())
}

fn settle(joined: Result<Result<(), CoreError>, JoinError>) -> Result<(), CliError> {
    joined.map_err(|e| CoreError::Internal(format!("controller task failed: {e}")))??;
    Ok(())
}

// ── Input ────────────────────────────────────────────────────────────

type Input = Box<dyn AsyncBufRead + Unpin + Send>;

async fn open_input(path: Option<&Path>) -> Result<Input, CliError> {
    match path {
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        Some(p) if p.as_os_str() == "-" => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        Some(p) => {
            let file = tokio::fs::File::open(p)
                .await
                .map_err(|e| CliError::Validation {
                    field: "input".into(),
                    reason: format!("cannot open {}: {e}", p.display()),
                })?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

/// Enqueue every valid line. Invalid lines are logged and skipped.
/// Returns how many messages were enqueued.
async fn feed(input: Input, queue: &MessageQueue) -> Result<u64, CliError> {
    let mut lines = input.lines();
    let mut lineno = 0_u64;
    let mut fed = 0_u64;
    while let Some(line) = lines.next_line().await? {
        lineno += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok((message, priority)) => {
                debug!(line = lineno, id = %message.id, priority, "enqueue");
                queue.apush_with_priority(message, priority).await;
                fed += 1;
            }
            Err(err) => warn!(line = lineno, error = %err, "skipping invalid input line"),
        }
    }
    info!(fed, lines = lineno, "input exhausted");
    Ok(fed)
}

/// `{"channel": ..., "priority": 5, ...}`; `priority` is removed from the
/// payload and defaults to [`DEFAULT_PRIORITY`].
fn parse_line(line: &str) -> Result<(Message, Priority), CoreError> {
    let mut value: Value = serde_json::from_str(line).map_err(|e| CoreError::InvalidMessage {
        message: e.to_string(),
    })?;
    let priority = match value.as_object_mut().and_then(|o| o.remove("priority")) {
        None => DEFAULT_PRIORITY,
        Some(raw) => raw
            .as_u64()
            .and_then(|p| Priority::try_from(p).ok())
            .ok_or_else(|| CoreError::InvalidMessage {
                message: format!("priority must be a non-negative integer, got {raw}"),
            })?,
    };
    Ok((Message::from_json(value)?, priority))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn priority_is_split_from_payload() {
        let (message, priority) =
            parse_line(r#"{"channel": "/db/exec", "priority": 5, "sql": "SELECT 1"}"#)
                .expect("valid line");
        assert_eq!(priority, 5);
        assert_eq!(message.channel, "/db/exec");
        assert_eq!(message.payload, json!({ "sql": "SELECT 1" }));
    }

    #[test]
    fn missing_priority_uses_default() {
        let (_, priority) = parse_line(r#"{"channel": "/x/log"}"#).expect("valid line");
        assert_eq!(priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn invalid_lines_are_rejected() {
        for line in [
            "not json",
            r#"[1, 2]"#,
            r#"{"payload": 1}"#,
            r#"{"channel": "/x/log", "priority": -1}"#,
            r#"{"channel": "/x/log", "priority": "high"}"#,
        ] {
            assert!(parse_line(line).is_err(), "accepted {line}");
        }
    }
}
