//! JSON-RPC 2.0 envelope shared by both transports.
//!
//! Only the routing fields are modeled: `id`, `method`, and which of
//! `params`/`result`/`error` is present. Payloads ride through as
//! [`serde_json::Value`].

use serde::{Serialize, Serializer};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes: the standard set plus the bridge's custom range.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const REQUEST_TIMEOUT: i64 = -32001;
    pub const SERVER_NOT_RUNNING: i64 = -32000;
}

/// A request id as JSON-RPC 2.0 defines it: integer, string, or the
/// literal `null`. `Null` is distinct from an absent id, which marks a
/// notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    Text(String),
    Null,
}

impl RequestId {
    /// Classify the `id` member of a decoded message.
    ///
    /// Fractional numbers, booleans, and composites are not legal ids;
    /// they map to `Null` so the sender still gets an error response
    /// addressed to something.
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_i64().map_or(Self::Null, Self::Number),
            Value::String(s) => Self::Text(s.clone()),
            _ => Self::Null,
        }
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_i64(*n),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Null => serializer.serialize_unit(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Outbound response envelope. A response always carries an id; when the
/// request's id could not be determined it is the literal `null`.
#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn response_id(id: Option<&RequestId>) -> RequestId {
    id.cloned().unwrap_or(RequestId::Null)
}

/// Build a success response for `id`.
pub fn response(id: Option<&RequestId>, result: Value) -> Value {
    serde_json::to_value(RpcResponse {
        jsonrpc: JSONRPC_VERSION,
        id: response_id(id),
        result: Some(result),
        error: None,
    })
    .unwrap_or(Value::Null)
}

/// Build an error response for `id`.
pub fn error_response(id: Option<&RequestId>, code: i64, message: impl Into<String>) -> Value {
    serde_json::to_value(RpcResponse {
        jsonrpc: JSONRPC_VERSION,
        id: response_id(id),
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
        }),
    })
    .unwrap_or(Value::Null)
}

/// The routed fields of one inbound message.
#[derive(Debug)]
pub struct Incoming {
    pub id: Option<RequestId>,
    pub method: Option<String>,
    pub params: Value,
}

impl Incoming {
    /// Split a decoded message into its routing fields. `None` when the
    /// message is not a JSON object at all.
    pub fn from_value(msg: &Value) -> Option<Self> {
        let obj = msg.as_object()?;
        Some(Self {
            id: obj.get("id").map(RequestId::from_value),
            method: obj
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        })
    }
}
