//! Real-time wire protocol.
//!
//! Every WebSocket text frame is one JSON envelope:
//!
//! ```text
//! { "type": "...", "payload": {...}, "timestamp": 1700000000000,
//!   "connectionId": "...", "subjectId": "..." }
//! ```
//!
//! Inbound types: `subscribe`, `unsubscribe`, `knob_request`,
//! `knob_adjustment`, `ping`. Outbound types: `connected`, `subscribed`,
//! `unsubscribed`, `knob_state`, `knob_adjustment`, `simulation_event`,
//! `performance_update`, `recommendations`, `pong`, `error`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{TuneError, TuneResult};
use crate::now_ms;
use crate::tuning::bus::{BusEvent, Topic};
use crate::tuning::registry::KnobView;
use crate::tuning::telemetry::PerformanceMetric;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Empty `topics` subscribes to every topic.
    Subscribe { topics: Vec<String>, subject_id: Option<String> },
    Unsubscribe { topics: Vec<String> },
    KnobRequest,
    KnobAdjustment { module: String, knob: String, value: f64, reason: Option<String> },
    Ping,
}

/// Types only the server sends. A client frame carrying one is rejected by
/// name instead of as an unknown type.
pub const SERVER_MESSAGE_TYPES: [&str; 9] = [
    "connected",
    "subscribed",
    "unsubscribed",
    "knob_state",
    "simulation_event",
    "performance_update",
    "recommendations",
    "pong",
    "error",
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicsPayload {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    subject_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdjustmentPayload {
    module: String,
    knob: String,
    value: f64,
    #[serde(default)]
    reason: Option<String>,
}

impl ClientMessage {
    pub fn parse(text: &str) -> TuneResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = if envelope.payload.is_null() { json!({}) } else { envelope.payload };
        match envelope.kind.as_str() {
            "subscribe" => {
                let p: TopicsPayload = serde_json::from_value(payload)?;
                Ok(ClientMessage::Subscribe {
                    topics: p.topics,
                    subject_id: p.subject_id.or(envelope.subject_id),
                })
            }
            "unsubscribe" => {
                let p: TopicsPayload = serde_json::from_value(payload)?;
                Ok(ClientMessage::Unsubscribe { topics: p.topics })
            }
            "knob_request" => Ok(ClientMessage::KnobRequest),
            "knob_adjustment" => {
                let p: AdjustmentPayload = serde_json::from_value(payload)?;
                Ok(ClientMessage::KnobAdjustment {
                    module: p.module,
                    knob: p.knob,
                    value: p.value,
                    reason: p.reason,
                })
            }
            "ping" => Ok(ClientMessage::Ping),
            other if SERVER_MESSAGE_TYPES.contains(&other) => Err(TuneError::InvalidValue(format!(
                "'{other}' is a server-originated message type"
            ))),
            other => Err(TuneError::InvalidValue(format!("unknown message type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Connected { topics: Vec<Topic>, subject_id: Option<String> },
    Subscribed { topics: Vec<Topic>, subject_id: Option<String> },
    Unsubscribed { topics: Vec<Topic> },
    KnobState {
        subject_id: String,
        knobs: BTreeMap<String, KnobView>,
        metrics: Vec<PerformanceMetric>,
    },
    /// A bus event; its type is derived from the topic.
    Event(BusEvent),
    Pong,
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(e: &TuneError) -> Self {
        ServerMessage::Error { code: e.code().to_string(), message: e.to_string() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::KnobState { .. } => "knob_state",
            ServerMessage::Event(e) => e.topic.message_type(),
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_envelope(&self, connection_id: &str) -> Envelope {
        let (payload, subject_id, timestamp) = match self {
            ServerMessage::Connected { topics, subject_id } => {
                (json!({ "topics": topics }), subject_id.clone(), now_ms())
            }
            ServerMessage::Subscribed { topics, subject_id } => {
                (json!({ "topics": topics }), subject_id.clone(), now_ms())
            }
            ServerMessage::Unsubscribed { topics } => (json!({ "topics": topics }), None, now_ms()),
            ServerMessage::KnobState { subject_id, knobs, metrics } => (
                json!({ "knobs": knobs, "metrics": metrics }),
                Some(subject_id.clone()),
                now_ms(),
            ),
            ServerMessage::Event(event) => (
                json!({ "seq": event.seq, "event": event.payload }),
                event.subject_id.clone(),
                event.timestamp_ms,
            ),
            ServerMessage::Pong => (Value::Null, None, now_ms()),
            ServerMessage::Error { code, message } => {
                (json!({ "code": code, "message": message }), None, now_ms())
            }
        };
        Envelope {
            kind: self.kind().to_string(),
            payload,
            timestamp,
            connection_id: Some(connection_id.to_string()),
            subject_id,
        }
    }

    pub fn to_json(&self, connection_id: &str) -> String {
        serde_json::to_value(self.to_envelope(connection_id))
            .unwrap_or_default()
            .to_string()
    }
}
