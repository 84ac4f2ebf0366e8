use std::path::Path;
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Rows, ToSql, params_from_iter};
use serde_json::{Number, Value};
use tracing::debug;

use super::{Backend, SqlBackend};
use crate::error::BoxError;
use crate::fetch::{FetchMode, Fetched, QueryParams, Row};
use crate::param::{ConnectParams, ParamMap, Parameter};

const IN_MEMORY: &str = ":memory:";

/// SQLite files through `rusqlite`.
///
/// Reads `<NAME>_PATH`, `<NAME>_BUSY_TIMEOUT_MS` (default 5000) and
/// `<NAME>_READ_ONLY` (default false).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    type Connection = Connection;

    const KIND: &'static str = "sqlite";

    fn param_map(&self, prefix: &str) -> ParamMap {
        ParamMap::new([
            ("path", Parameter::path(format!("{prefix}_PATH")).non_empty()),
            (
                "busy_timeout_ms",
                Parameter::unsigned(format!("{prefix}_BUSY_TIMEOUT_MS")).with_default(5000),
            ),
            (
                "read_only",
                Parameter::boolean(format!("{prefix}_READ_ONLY")).with_default(false),
            ),
        ])
    }

    fn open(&self, params: &ConnectParams) -> Result<Connection, BoxError> {
        let path = params.require_path("path")?;
        let read_only = params.require_bool("read_only")?;
        let busy_timeout = Duration::from_millis(params.require_u64("busy_timeout_ms")?);

        let conn = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            ensure_parent(path)?;
            Connection::open(path)?
        };
        conn.busy_timeout(busy_timeout)?;

        debug!(path = %path.display(), read_only, "sqlite connection opened");
        Ok(conn)
    }

    fn release(&self, connection: Connection) -> Result<(), BoxError> {
        connection.close().map_err(|(_, err)| Box::new(err) as BoxError)
    }
}

impl SqlBackend for SqliteBackend {
    fn run(
        &self,
        connection: &mut Connection,
        query: &str,
        params: &QueryParams,
        fetch: FetchMode,
    ) -> Result<Fetched, BoxError> {
        // The statement is finalized when it drops at the end of this call,
        // whichever way the call exits.
        let mut stmt = connection.prepare(query)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();

        match params {
            QueryParams::Positional(values) => {
                let bound: Vec<SqlValue> = values.iter().map(bind_value).collect();
                let rows = stmt.query(params_from_iter(bound.iter()))?;
                read_rows(rows, &columns, fetch)
            }
            QueryParams::Named(pairs) => {
                let bound: Vec<(String, SqlValue)> = pairs
                    .iter()
                    .map(|(name, value)| (placeholder(name), bind_value(value)))
                    .collect();
                let refs: Vec<(&str, &dyn ToSql)> = bound
                    .iter()
                    .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                    .collect();
                let rows = stmt.query(refs.as_slice())?;
                read_rows(rows, &columns, fetch)
            }
        }
    }

    fn commit(&self, connection: &mut Connection) -> Result<(), BoxError> {
        if !connection.is_autocommit() {
            connection.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if path.as_os_str() == IN_MEMORY {
        return Ok(());
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn read_rows(mut rows: Rows<'_>, columns: &[String], fetch: FetchMode) -> Result<Fetched, BoxError> {
    match fetch {
        FetchMode::None => {
            // Step to completion so DML statements take effect.
            while rows.next()?.is_some() {}
            Ok(Fetched::Nothing)
        }
        FetchMode::One => match rows.next()? {
            Some(row) => Ok(Fetched::Row(Some(to_row(row, columns)?))),
            None => Ok(Fetched::Row(None)),
        },
        FetchMode::All => {
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(to_row(row, columns)?);
            }
            Ok(Fetched::Rows(out))
        }
    }
}

fn to_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Row> {
    let mut out = Row::new();
    for (idx, name) in columns.iter().enumerate() {
        out.insert(name.clone(), column_value(row.get_ref(idx)?));
    }
    Ok(out)
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

/// Arrays and objects bind as their JSON text.
fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn placeholder(name: &str) -> String {
    if name.starts_with([':', '@', '$']) {
        name.to_owned()
    } else {
        format!(":{name}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn named_placeholders_get_a_colon() {
        assert_eq!(placeholder("id"), ":id");
        assert_eq!(placeholder("@id"), "@id");
        assert_eq!(placeholder(":id"), ":id");
    }

    #[test]
    fn binds_json_scalars() {
        assert_eq!(bind_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(bind_value(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(bind_value(&json!({"a": 1})), SqlValue::Text(r#"{"a":1}"#.into()));
    }

    #[test]
    fn runs_against_in_memory_database() {
        let backend = SqliteBackend;
        let mut conn = Connection::open_in_memory().expect("open");
        backend
            .run(
                &mut conn,
                "CREATE TABLE t (id INTEGER, name TEXT)",
                &QueryParams::none(),
                FetchMode::None,
            )
            .expect("create");
        backend
            .run(
                &mut conn,
                "INSERT INTO t VALUES (?1, ?2)",
                &QueryParams::Positional(vec![json!(1), json!("a")]),
                FetchMode::None,
            )
            .expect("insert");
        let fetched = backend
            .run(
                &mut conn,
                "SELECT id, name FROM t WHERE id = :id",
                &QueryParams::Named(vec![("id".into(), json!(1))]),
                FetchMode::One,
            )
            .expect("select");
        let row = fetched.into_rows().pop().expect("one row");
        assert_eq!(row.get("name"), Some(&json!("a")));
    }
}
