//! Wire message shapes for the child RPC protocol (spec.md §6): one JSON
//! object per line, distinguished structurally as request / response /
//! notification (spec.md §4.1).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl WireRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl WireNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// One parsed line from the child. The three shapes are distinguished
/// structurally, matching spec.md §4.1: a `request` carries `id` and
/// `method`; a `response` carries `id` and either `result` or `error`; a
/// `notification` carries `method` but no `id`.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<WireRpcError>,
    },
    Notification { method: String, params: Value },
}

/// Raw deserialization target; kept permissive since the child may send
/// any subset of fields depending on message shape.
#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireRpcError>,
}

/// Parses one line of child output. Returns `Err` on malformed JSON or a
/// shape that matches neither response nor notification (spec.md §4.1: an
/// unparseable line terminates the transport with `TransportError`).
pub fn parse_line(line: &str) -> Result<InboundMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(line)?;
    match (raw.id, raw.method) {
        (Some(id), _) => Ok(InboundMessage::Response {
            id,
            result: raw.result,
            error: raw.error,
        }),
        (None, Some(method)) => Ok(InboundMessage::Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        }),
        (None, None) => Err(serde::de::Error::custom(
            "message has neither `id` nor `method`",
        )),
    }
}

pub mod notifications {
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    pub struct StreamChunk {
        pub stream_id: String,
        pub token: String,
        #[serde(default)]
        pub logprob: Option<f64>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct StreamStats {
        pub stream_id: String,
        pub tokens_generated: u64,
        pub tokens_per_sec: f64,
        pub time_to_first_token: f64,
        pub total_time: f64,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct StreamEvent {
        pub stream_id: String,
        pub kind: StreamEventKind,
        #[serde(default)]
        pub message: Option<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum StreamEventKind {
        Completed,
        Error,
    }
}
