use chrono::DateTime;
use serde_json::Value;

pub const READY: &str = "ready";
pub const SUBSCRIPTIONS_UPDATED: &str = "subscriptions.updated";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Ready,
    SubscriptionsUpdated,
    Error,
    /// Anything the server sends that is not protocol state, including types
    /// this client has never heard of.
    Domain(String),
}

impl EventKind {
    pub fn from_type(value: &str) -> Self {
        match value {
            READY => EventKind::Ready,
            SUBSCRIPTIONS_UPDATED => EventKind::SubscriptionsUpdated,
            ERROR => EventKind::Error,
            other => EventKind::Domain(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ready => READY,
            EventKind::SubscriptionsUpdated => SUBSCRIPTIONS_UPDATED,
            EventKind::Error => ERROR,
            EventKind::Domain(kind) => kind,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, EventKind::Domain(_))
    }
}

/// One message received from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub request_id: Option<String>,
    pub sequence: Option<u64>,
    /// Milliseconds since the Unix epoch, as stamped by the server.
    pub timestamp: Option<i64>,
    pub chat_id: Option<String>,
    pub entity_ids: Vec<String>,
    pub raw: Value,
}

const SEQUENCE_KEYS: &[&str] = &["sequence", "seq"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts"];
const ENTITY_ID_KEYS: &[&str] = &["entityIDs", "ids"];

impl Event {
    /// Builds an event from a decoded JSON value. Never fails: each envelope
    /// field is read on its own, so one with an unexpected shape is dropped
    /// without affecting the others. The raw payload is always kept.
    pub fn from_value(raw: Value) -> Self {
        let kind = EventKind::from_type(string_field(&raw, "type").unwrap_or_default());
        let request_id = string_field(&raw, "requestID").map(str::to_string);
        let chat_id = string_field(&raw, "chatID").map(str::to_string);
        let sequence = SEQUENCE_KEYS
            .iter()
            .find_map(|key| raw.get(key).and_then(Value::as_u64));
        let timestamp = TIMESTAMP_KEYS
            .iter()
            .find_map(|key| raw.get(key).and_then(timestamp_millis));
        let entity_ids: Vec<String> = ENTITY_ID_KEYS
            .iter()
            .find_map(|key| raw.get(key).and_then(Value::as_array))
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            kind,
            request_id,
            sequence,
            timestamp,
            chat_id,
            entity_ids,
            raw,
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(raw))
    }

    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }
}

fn string_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

/// Epoch milliseconds, or an RFC3339 string.
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.timestamp_millis()),
        _ => None,
    }
}
