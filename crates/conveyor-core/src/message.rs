// ── Message model ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// A unit of work: a channel plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Parse `{ "channel": "...", <payload fields...> }`.
    ///
    /// Everything except `channel` becomes the payload object.
    pub fn from_json(value: Value) -> Result<Self, CoreError> {
        let Value::Object(mut fields) = value else {
            return Err(CoreError::InvalidMessage {
                message: "expected a JSON object".into(),
            });
        };
        let channel = match fields.remove("channel") {
            Some(Value::String(channel)) if !channel.trim().is_empty() => channel,
            Some(_) => {
                return Err(CoreError::InvalidMessage {
                    message: "`channel` must be a non-empty string".into(),
                });
            }
            None => {
                return Err(CoreError::InvalidMessage {
                    message: "missing `channel` field".into(),
                });
            }
        };
        Ok(Self::new(channel, Value::Object(fields)))
    }

    /// Routing key derived from the channel.
    pub fn event(&self) -> &str {
        event_name(&self.channel)
    }

    /// Top-level payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }
}

/// Strip the path-like prefix of a channel: everything up to and
/// including the last `/`, ignoring trailing slashes.
///
/// `"/x/unknown"` → `"unknown"`, `"jobs/exec/"` → `"exec"`, `"log"` → `"log"`.
pub fn event_name(channel: &str) -> &str {
    let trimmed = channel.trim_end_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, event)| event)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_name_strips_prefix() {
        assert_eq!(event_name("/x/unknown"), "unknown");
        assert_eq!(event_name("jobs/exec/"), "exec");
        assert_eq!(event_name("log"), "log");
        assert_eq!(event_name("/"), "");
    }

    #[test]
    fn from_json_splits_channel_and_payload() {
        let message = Message::from_json(json!({ "channel": "/db/query", "sql": "SELECT 1" }))
            .expect("valid message");
        assert_eq!(message.channel, "/db/query");
        assert_eq!(message.event(), "query");
        assert_eq!(message.payload, json!({ "sql": "SELECT 1" }));
        assert_eq!(message.field("sql"), Some(&json!("SELECT 1")));
    }

    #[test]
    fn from_json_rejects_bad_shapes() {
        for bad in [json!([1, 2]), json!({ "sql": "x" }), json!({ "channel": 5 }), json!({ "channel": " " })] {
            assert!(matches!(
                Message::from_json(bad),
                Err(CoreError::InvalidMessage { .. })
            ));
        }
    }
}
