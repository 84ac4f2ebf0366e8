// ── Fetch strategies and query parameters ──

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::Error;

/// A result row, column name to value.
pub type Row = Map<String, Value>;

/// How many rows `execute` reads back.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchMode {
    /// Run for side effects only.
    #[default]
    None,
    One,
    All,
}

impl FetchMode {
    /// Case-insensitive parse with a crate error on failure.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        raw.trim()
            .parse()
            .map_err(|_| Error::UnknownFetchMode(raw.to_owned()))
    }
}

/// What `execute` produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Fetched {
    /// `FetchMode::None`, or the client was not open.
    #[default]
    Nothing,
    /// `FetchMode::One`; `None` when the statement returned no rows.
    Row(Option<Row>),
    Rows(Vec<Row>),
}

impl Fetched {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    /// Flatten into a list of rows.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Nothing | Self::Row(None) => Vec::new(),
            Self::Row(Some(row)) => vec![row],
            Self::Rows(rows) => rows,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Nothing | Self::Row(None) => Value::Null,
            Self::Row(Some(row)) => Value::Object(row.clone()),
            Self::Rows(rows) => Value::Array(rows.iter().cloned().map(Value::Object).collect()),
        }
    }
}

/// Bind parameters for a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParams {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Default for QueryParams {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

impl QueryParams {
    pub fn none() -> Self {
        Self::default()
    }

    /// Arrays bind positionally, objects by name; `null` binds nothing.
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Null => Ok(Self::none()),
            Value::Array(items) => Ok(Self::Positional(items.clone())),
            Value::Object(fields) => Ok(Self::Named(
                fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            other => Err(Error::InvalidQueryParams(format!(
                "expected an array or object, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(values) => values.is_empty(),
            Self::Named(values) => values.is_empty(),
        }
    }
}

impl From<Vec<Value>> for QueryParams {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}
