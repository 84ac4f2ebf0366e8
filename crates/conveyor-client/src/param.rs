// ── Typed connection parameters ──
//
// A `Parameter` names a settings key, the type its raw value is coerced
// into, and any validators. A `ParamMap` is the closed set of
// parameters a client consumes when it is constructed; resolving it
// against `Settings` yields the `ConnectParams` handed to the backend.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde_json::Value;
use strum::Display;
use url::Url;

use crate::error::Error;
use crate::settings::Settings;

/// Predicate run on a coerced value; `Err` carries the rejection reason.
pub type Validator = Arc<dyn Fn(&ParamValue) -> Result<(), String> + Send + Sync>;

// ── ParamKind ────────────────────────────────────────────────────

/// Target type of a parameter's coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Unsigned,
    Float,
    Boolean,
    Secret,
    Path,
    Url,
}

impl ParamKind {
    /// Coerce a raw settings value into this kind.
    ///
    /// Numeric and boolean kinds also accept strings, since values coming
    /// from the environment are always strings.
    pub fn coerce(self, raw: &Value) -> Result<ParamValue, String> {
        match self {
            Self::String => scalar_string(raw).map(ParamValue::String),
            Self::Integer => coerce_integer(raw).map(ParamValue::Integer),
            Self::Unsigned => coerce_unsigned(raw).map(ParamValue::Unsigned),
            Self::Float => coerce_float(raw).map(ParamValue::Float),
            Self::Boolean => coerce_bool(raw).map(ParamValue::Boolean),
            Self::Secret => scalar_string(raw).map(|s| ParamValue::Secret(SecretString::from(s))),
            Self::Path => match raw {
                Value::String(s) => Ok(ParamValue::Path(PathBuf::from(s))),
                other => Err(mismatch("a path string", other)),
            },
            Self::Url => match raw {
                Value::String(s) => Url::parse(s)
                    .map(ParamValue::Url)
                    .map_err(|e| format!("{s:?} is not a valid URL: {e}")),
                other => Err(mismatch("a URL string", other)),
            },
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn mismatch(expected: &str, got: &Value) -> String {
    format!("expected {expected}, got {}", describe(got))
}

fn scalar_string(raw: &Value) -> Result<String, String> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(mismatch("a string", other)),
    }
}

fn coerce_integer(raw: &Value) -> Result<i64, String> {
    match raw {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| format!("{s:?} is not an integer: {e}")),
        other => Err(mismatch("an integer", other)),
    }
}

fn coerce_unsigned(raw: &Value) -> Result<u64, String> {
    match raw {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("{n} is not a non-negative integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| format!("{s:?} is not a non-negative integer: {e}")),
        other => Err(mismatch("a non-negative integer", other)),
    }
}

fn coerce_float(raw: &Value) -> Result<f64, String> {
    match raw {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a number")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| format!("{s:?} is not a number: {e}")),
        other => Err(mismatch("a number", other)),
    }
}

fn coerce_bool(raw: &Value) -> Result<bool, String> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{n} is not a boolean (use 0 or 1)")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(format!("{s:?} is not a boolean")),
        },
        other => Err(mismatch("a boolean", other)),
    }
}

// ── ParamValue ───────────────────────────────────────────────────

/// A coerced, validated parameter value.
#[derive(Debug, Clone)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Boolean(bool),
    Secret(SecretString),
    Path(PathBuf),
    Url(Url),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::String(_) => ParamKind::String,
            Self::Integer(_) => ParamKind::Integer,
            Self::Unsigned(_) => ParamKind::Unsigned,
            Self::Float(_) => ParamKind::Float,
            Self::Boolean(_) => ParamKind::Boolean,
            Self::Secret(_) => ParamKind::Secret,
            Self::Path(_) => ParamKind::Path,
            Self::Url(_) => ParamKind::Url,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Unsigned(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(n) => Some(*n),
            Self::Integer(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&SecretString> {
        match self {
            Self::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&Url> {
        match self {
            Self::Url(u) => Some(u),
            _ => None,
        }
    }
}

/// Secrets render redacted.
impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Unsigned(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Secret(_) => f.write_str("[redacted]"),
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => write!(f, "{u}"),
        }
    }
}

// ── Parameter ────────────────────────────────────────────────────

/// A single typed configuration value consumed when connecting a client.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    kind: ParamKind,
    validators: Vec<Validator>,
    default: Option<Value>,
    value: Option<ParamValue>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.is_required())
            .finish_non_exhaustive()
    }
}

impl Parameter {
    /// Declare a parameter read from the settings key `name`.
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            validators: Vec::new(),
            default: None,
            value: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer)
    }

    pub fn unsigned(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Unsigned)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Secret)
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Path)
    }

    pub fn url(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Url)
    }

    /// Add a validator run after coercion. Validators run in the order
    /// they were added and the first rejection wins.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&ParamValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Make the parameter optional. The default goes through the same
    /// coercion and validation as a configured value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Reject empty strings and paths.
    pub fn non_empty(self) -> Self {
        self.with_validator(|value| {
            let empty = match value {
                ParamValue::String(s) => s.trim().is_empty(),
                ParamValue::Path(p) => p.as_os_str().is_empty(),
                _ => false,
            };
            if empty {
                Err("must not be empty".into())
            } else {
                Ok(())
            }
        })
    }

    /// Reject numeric values outside `min..=max`.
    pub fn within(self, min: i64, max: i64) -> Self {
        self.with_validator(move |value| {
            let n = match value {
                ParamValue::Integer(n) => i128::from(*n),
                ParamValue::Unsigned(n) => i128::from(*n),
                _ => return Ok(()),
            };
            if (i128::from(min)..=i128::from(max)).contains(&n) {
                Ok(())
            } else {
                Err(format!("{n} is outside {min}..={max}"))
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// The value stored by the last successful
    /// [`validate_and_set`](Self::validate_and_set).
    pub fn value(&self) -> Option<&ParamValue> {
        self.value.as_ref()
    }

    /// Coerce and validate `raw`, returning the coerced value.
    pub fn validate(&self, raw: &Value) -> Result<ParamValue, Error> {
        let value = self.kind.coerce(raw).map_err(|reason| Error::Validation {
            parameter: self.name.clone(),
            reason,
        })?;
        for validator in &self.validators {
            validator(&value).map_err(|reason| Error::Validation {
                parameter: self.name.clone(),
                reason,
            })?;
        }
        Ok(value)
    }

    /// Validate `raw` and keep the coerced value for [`value`](Self::value).
    pub fn validate_and_set(&mut self, raw: &Value) -> Result<(), Error> {
        self.value = Some(self.validate(raw)?);
        Ok(())
    }

    /// Look this parameter up in `settings`, falling back to the default.
    pub fn resolve(&self, settings: &Settings) -> Result<ParamValue, Error> {
        let raw = settings
            .get(&self.name)
            .or(self.default.as_ref())
            .ok_or_else(|| Error::MissingParameter {
                parameter: self.name.clone(),
            })?;
        self.validate(raw)
    }
}

// ── ParamMap ─────────────────────────────────────────────────────

/// Closed, ordered set of parameter declarations keyed by the name the
/// backend reads them under.
///
/// There is no way to add a declaration after construction.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    params: IndexMap<String, Parameter>,
}

impl ParamMap {
    pub fn new<K, I>(declarations: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Parameter)>,
    {
        Self {
            params: declarations
                .into_iter()
                .map(|(key, param)| (key.into(), param))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.params.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(k, p)| (k.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Resolve every declaration against `settings`.
    ///
    /// Fails on the first missing or invalid value, before anything is
    /// connected.
    pub fn resolve(&self, settings: &Settings) -> Result<ConnectParams, Error> {
        let mut values = IndexMap::with_capacity(self.params.len());
        for (key, param) in &self.params {
            values.insert(key.clone(), param.resolve(settings)?);
        }
        Ok(ConnectParams { values })
    }
}

// ── ConnectParams ────────────────────────────────────────────────

/// Resolved parameter values, keyed like the `ParamMap` they came from.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    values: IndexMap<String, ParamValue>,
}

impl ConnectParams {
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&ParamValue, Error> {
        self.values.get(key).ok_or_else(|| Error::MissingParameter {
            parameter: key.to_owned(),
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str, Error> {
        let value = self.require(key)?;
        value.as_str().ok_or_else(|| wrong_kind(key, ParamKind::String, value))
    }

    pub fn require_u64(&self, key: &str) -> Result<u64, Error> {
        let value = self.require(key)?;
        value.as_u64().ok_or_else(|| wrong_kind(key, ParamKind::Unsigned, value))
    }

    pub fn require_bool(&self, key: &str) -> Result<bool, Error> {
        let value = self.require(key)?;
        value.as_bool().ok_or_else(|| wrong_kind(key, ParamKind::Boolean, value))
    }

    pub fn require_path(&self, key: &str) -> Result<&Path, Error> {
        let value = self.require(key)?;
        value.as_path().ok_or_else(|| wrong_kind(key, ParamKind::Path, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn wrong_kind(key: &str, expected: ParamKind, got: &ParamValue) -> Error {
    Error::Validation {
        parameter: key.to_owned(),
        reason: format!("expected {expected}, resolved as {}", got.kind()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn coerces_numeric_strings() {
        let port = Parameter::unsigned("PORT");
        assert_eq!(port.validate(&json!("5432")).expect("valid").as_u64(), Some(5432));
        assert_eq!(port.validate(&json!(5432)).expect("valid").as_u64(), Some(5432));
        assert!(port.validate(&json!(-1)).is_err());
        assert!(port.validate(&json!("abc")).is_err());
    }

    #[test]
    fn coerces_boolean_spellings() {
        let flag = Parameter::boolean("READ_ONLY");
        for raw in [json!(true), json!("yes"), json!("ON"), json!(1), json!("1")] {
            assert_eq!(flag.validate(&raw).expect("truthy").as_bool(), Some(true));
        }
        for raw in [json!(false), json!("no"), json!("Off"), json!(0)] {
            assert_eq!(flag.validate(&raw).expect("falsy").as_bool(), Some(false));
        }
        assert!(flag.validate(&json!("maybe")).is_err());
    }

    #[test]
    fn validator_rejects_after_coercion() {
        let port = Parameter::unsigned("PORT").within(1, 65_535);
        let err = port.validate(&json!(70_000)).expect_err("out of range");
        assert!(err.is_validation());
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn validators_compose() {
        let name = Parameter::string("NAME")
            .non_empty()
            .with_validator(|value| match value.as_str() {
                Some(s) if s.len() > 8 => Err("longer than 8 characters".into()),
                _ => Ok(()),
            });
        assert!(name.validate(&json!("ok")).is_ok());

        let err = name.validate(&json!("  ")).expect_err("empty");
        assert!(err.to_string().contains("must not be empty"));
        let err = name.validate(&json!("much too long")).expect_err("too long");
        assert!(err.to_string().contains("longer than 8"));
    }

    #[test]
    fn validate_and_set_stores_coerced_value() {
        let mut host = Parameter::string("HOST").non_empty();
        assert!(host.value().is_none());
        host.validate_and_set(&json!("db.internal")).expect("valid");
        assert_eq!(host.value().and_then(ParamValue::as_str), Some("db.internal"));

        assert!(host.validate_and_set(&json!("   ")).is_err());
        // a failed set keeps the previous value
        assert_eq!(host.value().and_then(ParamValue::as_str), Some("db.internal"));
    }

    #[test]
    fn resolve_uses_defaults_and_reports_missing() {
        let map = ParamMap::new([
            ("host", Parameter::string("DB_HOST")),
            ("port", Parameter::unsigned("DB_PORT").with_default(5432)),
        ]);

        let settings = Settings::new().with("DB_HOST", "localhost");
        let params = map.resolve(&settings).expect("resolves");
        assert_eq!(params.require_str("host").expect("host"), "localhost");
        assert_eq!(params.require_u64("port").expect("port"), 5432);

        let err = map.resolve(&Settings::new()).expect_err("missing host");
        assert!(matches!(err, Error::MissingParameter { ref parameter } if parameter == "DB_HOST"));
    }

    #[test]
    fn secrets_are_redacted() {
        let value = Parameter::secret("DB_PASSWORD")
            .validate(&json!("hunter2"))
            .expect("valid");
        assert_eq!(value.to_string(), "[redacted]");
        assert!(!format!("{value:?}").contains("hunter2"));
    }

    #[test]
    fn require_reports_kind_mismatch() {
        let map = ParamMap::new([("port", Parameter::string("PORT"))]);
        let params = map
            .resolve(&Settings::new().with("PORT", "80"))
            .expect("resolves");
        assert!(params.require_u64("port").is_err());
        assert!(params.require("missing").is_err());
    }
}
