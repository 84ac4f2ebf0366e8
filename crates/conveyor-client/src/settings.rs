// ── Settings mapping ──
//
// Arbitrary string-keyed configuration handed to client constructors.
// Keys are upper-cased on the way in so that TOML keys, environment
// variables and parameter declarations agree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed configuration values consumed by parameter maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>", into = "BTreeMap<String, Value>")]
pub struct Settings {
    values: BTreeMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, normalizing the key to upper case.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<Value>) -> Option<Value> {
        self.values
            .insert(normalize_key(key.as_ref()), value.into())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(&normalize_key(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(&normalize_key(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(&normalize_key(key))
    }

    /// Overlay `other` on top of `self`; keys present in both take `other`'s value.
    pub fn merge(&mut self, other: Settings) {
        self.values.extend(other.values);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

impl From<BTreeMap<String, Value>> for Settings {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        raw.into_iter().collect()
    }
}

impl From<Settings> for BTreeMap<String, Value> {
    fn from(settings: Settings) -> Self {
        settings.values
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (key, value) in iter {
            settings.insert(key, value);
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Settings;

    #[test]
    fn keys_are_case_insensitive() {
        let settings = Settings::new().with("db_path", "/tmp/x.db");
        assert_eq!(settings.get("DB_PATH"), Some(&json!("/tmp/x.db")));
        assert!(settings.contains_key("Db_Path"));
    }

    #[test]
    fn deserializes_and_normalizes() {
        let settings: Settings =
            serde_json::from_value(json!({ "queue_max_size": 10, "HOST": "db" })).expect("valid");
        assert_eq!(settings.get("QUEUE_MAX_SIZE"), Some(&json!(10)));
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn merge_overrides_existing_keys() {
        let mut base = Settings::new().with("a", 1).with("b", 2);
        base.merge(Settings::new().with("B", 3));
        assert_eq!(base.get("b"), Some(&json!(3)));
        assert_eq!(base.get("a"), Some(&json!(1)));
    }
}
