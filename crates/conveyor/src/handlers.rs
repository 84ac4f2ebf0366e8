//! Built-in handlers registered by `conveyor run`.
//!
//! | event   | payload                                               | effect                          |
//! |---------|-------------------------------------------------------|---------------------------------|
//! | `exec`  | `sql`, optional `params`, `client`, `fetch`           | run + commit                    |
//! | `query` | same; `fetch` defaults to `all`                       | run, print one JSON line        |
//! | `log`   | anything                                              | log the payload at info         |
//!
//! `client` defaults to the first declared client, which must be SQLite.

use std::io::{self, Write};

use serde_json::{Value, json};
use tracing::info;

use conveyor_client::{
    BoxError, ClientMap, Executable, FetchMode, Fetched, QueryParams, SqliteClient,
};
use conveyor_core::{AsyncEventMap, HandlerResult, Message, SyncEventMap};

// ── Event maps ───────────────────────────────────────────────────────

pub fn sync_events() -> SyncEventMap {
    SyncEventMap::builder()
        .on("exec", |ctx, message| {
            let request = SqlRequest::parse(message, FetchMode::None)?;
            run_sql(ctx.clients(), &request)?;
            Ok(())
        })
        .on("query", |ctx, message| {
            let request = SqlRequest::parse(message, FetchMode::All)?;
            let fetched = run_sql(ctx.clients(), &request)?;
            emit(message, &fetched)
        })
        .on("log", |_, message| {
            log_payload(message);
            Ok(())
        })
        .build()
}

pub fn async_events() -> AsyncEventMap {
    AsyncEventMap::builder()
        .on("exec", |ctx, message: Message| async move {
            let request = SqlRequest::parse(&message, FetchMode::None)?;
            ctx.blocking(move |clients| run_sql(clients, &request).map(drop))
                .await
        })
        .on("query", |ctx, message: Message| async move {
            let request = SqlRequest::parse(&message, FetchMode::All)?;
            let fetched = ctx.blocking(move |clients| run_sql(clients, &request)).await?;
            emit(&message, &fetched)
        })
        .on("log", |_, message: Message| async move {
            log_payload(&message);
            HandlerResult::Ok(())
        })
        .build()
}

// ── SQL requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct SqlRequest {
    client: Option<String>,
    sql: String,
    params: QueryParams,
    fetch: FetchMode,
}

impl SqlRequest {
    fn parse(message: &Message, default_fetch: FetchMode) -> Result<Self, BoxError> {
        let sql = message
            .field("sql")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or("payload needs a non-empty string field 'sql'")?;
        let client = match message.field("client") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(other) => return Err(format!("'client' must be a string, got {other}").into()),
        };
        let params = QueryParams::from_json(message.field("params").unwrap_or(&Value::Null))?;
        let fetch = match message.field("fetch").and_then(Value::as_str) {
            Some(raw) => FetchMode::parse(raw)?,
            None => default_fetch,
        };

        Ok(Self {
            client,
            sql: sql.to_owned(),
            params,
            fetch,
        })
    }
}

fn run_sql(clients: &ClientMap, request: &SqlRequest) -> Result<Fetched, BoxError> {
    let name = match request.client.as_deref() {
        Some(name) => name,
        None => clients.names().next().ok_or("no clients are configured")?,
    };
    let client = clients.typed::<SqliteClient>(name)?;
    let fetched = client.execute(&request.sql, &request.params, request.fetch)?;
    client.commit()?;
    Ok(fetched)
}

// ── Output ───────────────────────────────────────────────────────────

fn emit(message: &Message, fetched: &Fetched) -> HandlerResult {
    let line = json!({
        "id": message.id,
        "channel": message.channel,
        "result": fetched.to_json(),
    });
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn log_payload(message: &Message) {
    info!(
        id = %message.id,
        channel = %message.channel,
        payload = %message.payload,
        "log event"
    );
}
