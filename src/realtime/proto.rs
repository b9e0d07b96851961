use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Emitted after a transport opens.
pub const CONNECTED: &str = "connected";
/// Emitted when a transport closes or an explicit disconnect tears it down.
pub const DISCONNECTED: &str = "disconnected";
/// Emitted for transport-level errors, payload `{"message": ...}`.
pub const ERROR: &str = "error";
/// Emitted for every decoded frame with the full envelope as payload.
pub const MESSAGE: &str = "message";
/// Emitted when a retry is scheduled, payload `{"attempt": n, "delay_ms": ms}`.
pub const RECONNECTING: &str = "reconnecting";

pub const TASK_EVENTS: [&str; 4] = [
    "task.updated",
    "task.created",
    "task.deleted",
    "task.status.changed",
];
pub const PROJECT_EVENTS: [&str; 3] = ["project.updated", "project.created", "project.deleted"];
pub const COMMENT_EVENTS: [&str; 2] = ["comment.created", "comment.updated"];
pub const NOTIFICATION_EVENTS: [&str; 1] = ["notification.new"];

/// Server push envelope.
///
/// Any JSON object decodes. `event` is kept only when it is a string, and a
/// missing `data` becomes `null`. `type` is passed through untouched.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: Value,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
}

impl InboundMessage {
    /// Decodes a text frame. Fails for invalid JSON and for non-object JSON.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let mut fields: Map<String, Value> = serde_json::from_str(text)?;
        let event = match fields.remove("event") {
            Some(Value::String(event)) => Some(event),
            _ => None,
        };
        let data = fields.remove("data").unwrap_or(Value::Null);
        let kind = fields.remove("type").filter(|kind| !kind.is_null());
        Ok(Self { event, data, kind })
    }

    /// Encodes the envelope back to a JSON text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Payload delivered to generic `message` listeners.
    pub fn envelope(&self) -> Value {
        let mut fields = Map::new();
        if let Some(kind) = &self.kind {
            fields.insert("type".to_string(), kind.clone());
        }
        if let Some(event) = &self.event {
            fields.insert("event".to_string(), Value::String(event.clone()));
        }
        fields.insert("data".to_string(), self.data.clone());
        Value::Object(fields)
    }
}

/// Client-to-server envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub event: String,
    pub data: Value,
}

impl OutboundMessage {
    /// Builds an outbound frame for `event`.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Decodes a client frame, as a server would.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encodes the frame as JSON text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
