#![allow(clippy::unwrap_used)]
// Integration tests for `SqliteClient` against temporary database files.

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use conveyor_client::{
    Closable, ConnectState, Connectable, Error, Executable, FetchMode, Fetched, QueryParams,
    Settings, SqliteBackend, SqliteClient,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> (TempDir, SqliteClient) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::new().with("DB_PATH", dir.path().join("nested/app.db").to_string_lossy().into_owned());
    let client = SqliteClient::from_settings("db", SqliteBackend, &settings).unwrap();
    (dir, client)
}

fn seed(client: &SqliteClient) {
    client
        .execute(
            "CREATE TABLE jobs (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            &QueryParams::none(),
            FetchMode::None,
        )
        .unwrap();
    for (id, name) in [(1, "alpha"), (2, "beta")] {
        client
            .execute(
                "INSERT INTO jobs (id, name) VALUES (?1, ?2)",
                &QueryParams::Positional(vec![json!(id), json!(name)]),
                FetchMode::None,
            )
            .unwrap();
    }
}

// ── Construction ────────────────────────────────────────────────────

#[test]
fn test_missing_path_fails_before_connecting() {
    let err = SqliteClient::from_settings("db", SqliteBackend, &Settings::new()).unwrap_err();
    assert!(err.is_validation(), "expected validation error, got: {err:?}");
    assert!(matches!(err, Error::MissingParameter { ref parameter } if parameter == "DB_PATH"));
}

#[test]
fn test_invalid_busy_timeout_is_rejected() {
    let settings = Settings::new()
        .with("DB_PATH", "/tmp/whatever.db")
        .with("DB_BUSY_TIMEOUT_MS", "soon");
    let err = SqliteClient::from_settings("db", SqliteBackend, &settings).unwrap_err();
    assert!(err.is_validation());
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[test]
fn test_connect_and_close_transitions() {
    let (_dir, client) = setup();
    assert_eq!(client.state(), ConnectState::Closed);

    client.connect().unwrap();
    assert_eq!(client.state(), ConnectState::Open);

    // reconnect while open replaces the handle
    client.connect().unwrap();
    assert_eq!(client.state(), ConnectState::Open);

    client.close().unwrap();
    assert_eq!(client.state(), ConnectState::Closed);

    // closing twice is harmless
    client.close().unwrap();
}

#[test]
fn test_connect_failure_reverts_to_closed() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::new()
        .with("DB_PATH", dir.path().join("absent.db").to_string_lossy().into_owned())
        .with("DB_READ_ONLY", true);
    let client = SqliteClient::from_settings("db", SqliteBackend, &settings).unwrap();

    let err = client.connect().unwrap_err();
    assert!(err.is_connection(), "expected connection error, got: {err:?}");
    assert_eq!(err.client_name(), Some("db"));
    assert_eq!(client.state(), ConnectState::Closed);
}

// ── Execution ───────────────────────────────────────────────────────

#[test]
fn test_execute_on_closed_client_returns_nothing() {
    let (_dir, client) = setup();
    let fetched = client
        .execute("SELECT 1", &QueryParams::none(), FetchMode::All)
        .unwrap();
    assert_eq!(fetched, Fetched::Nothing);
    client.commit().unwrap();
    assert_eq!(client.state(), ConnectState::Closed);
}

#[test]
fn test_fetch_modes() {
    let (_dir, client) = setup();
    client.connect().unwrap();
    seed(&client);

    let all = client
        .execute("SELECT id, name FROM jobs ORDER BY id", &QueryParams::none(), FetchMode::All)
        .unwrap();
    let names: Vec<_> = all.into_rows().into_iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("alpha"), json!("beta")]);

    let one = client
        .execute(
            "SELECT name FROM jobs WHERE id = :id",
            &QueryParams::from_json(&json!({ "id": 2 })).unwrap(),
            FetchMode::One,
        )
        .unwrap();
    assert_eq!(one.to_json(), json!({ "name": "beta" }));

    let none = client
        .execute("SELECT name FROM jobs WHERE id = 99", &QueryParams::none(), FetchMode::One)
        .unwrap();
    assert_eq!(none, Fetched::Row(None));
}

#[test]
fn test_bad_statement_is_an_execute_error() {
    let (_dir, client) = setup();
    client.connect().unwrap();
    let err = client
        .execute("SELEKT nope", &QueryParams::none(), FetchMode::None)
        .unwrap_err();
    assert!(matches!(err, Error::Execute { .. }));
    // the client stays usable
    assert_eq!(client.state(), ConnectState::Open);
}

#[test]
fn test_commit_persists_explicit_transaction() {
    let (dir, client) = setup();
    client.connect().unwrap();
    seed(&client);
    client
        .execute("BEGIN", &QueryParams::none(), FetchMode::None)
        .unwrap();
    client
        .execute("DELETE FROM jobs WHERE id = 1", &QueryParams::none(), FetchMode::None)
        .unwrap();
    client.commit().unwrap();
    client.close().unwrap();

    let settings = Settings::new().with("DB_PATH", dir.path().join("nested/app.db").to_string_lossy().into_owned());
    let reader = SqliteClient::from_settings("db", SqliteBackend, &settings).unwrap();
    let count = reader
        .with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get::<_, i64>(0))?)
        })
        .unwrap();
    assert_eq!(count, 1);
}

// ── Scoped use ──────────────────────────────────────────────────────

#[test]
fn test_with_connection_auto_connects() {
    let (_dir, client) = setup();
    let one: i64 = client
        .with_connection(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(one, 1);
    assert_eq!(client.state(), ConnectState::Open);
}

#[test]
fn test_session_closes_what_it_opened() {
    let (_dir, client) = setup();
    {
        let session = client.session().unwrap();
        assert_eq!(session.state(), ConnectState::Open);
        seed(&session);
    }
    assert_eq!(client.state(), ConnectState::Closed);

    client.connect().unwrap();
    {
        let _session = client.session().unwrap();
    }
    assert_eq!(client.state(), ConnectState::Open, "an already open client stays open");
}
