//! JSON-RPC 2.0 message type used by the MCP transfer layer
//!
//! A single [`RpcMessage`] value covers the four wire shapes: request,
//! notification, response, and error. Serialization always emits
//! `"jsonrpc": "2.0"`, and empty parameter payloads serialize as an empty
//! object rather than an empty array (MCP servers reject `"params": []`).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{VolleyError, VolleyResult};

/// Monotonic source for auto-assigned request ids
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// JSON-RPC request id: a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Next auto-assigned id, as a decimal string
    pub fn next() -> Self {
        RequestId::String(NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A single JSON-RPC 2.0 message
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// A call expecting a response
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// A call with no response
    Notification { method: String, params: Value },
    /// A successful response
    Response { id: RequestId, result: Value },
    /// An error response (`id` is absent for parse-level errors)
    Error {
        id: Option<RequestId>,
        error: RpcError,
    },
}

/// Normalize a params payload: anything empty or null becomes `{}`
fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        Value::Array(a) if a.is_empty() => Value::Object(Map::new()),
        other => other,
    }
}

impl RpcMessage {
    /// Build a request with an auto-assigned monotonic id
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Self::request_with_id(RequestId::next(), method, params)
    }

    /// Build a request with an explicit id
    pub fn request_with_id(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Request {
            id,
            method: method.into(),
            params: normalize_params(params),
        }
    }

    /// Build a notification
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params: normalize_params(params),
        }
    }

    /// Build a successful response
    pub fn response(id: RequestId, result: Value) -> Self {
        RpcMessage::Response { id, result }
    }

    /// Build an error response
    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        RpcMessage::Error { id, error }
    }

    /// The message's request id, if it carries one
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            RpcMessage::Request { id, .. } | RpcMessage::Response { id, .. } => Some(id),
            RpcMessage::Error { id, .. } => id.as_ref(),
            RpcMessage::Notification { .. } => None,
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            RpcMessage::Request { method, .. } | RpcMessage::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    /// The result payload for successful responses
    pub fn result(&self) -> Option<&Value> {
        match self {
            RpcMessage::Response { result, .. } => Some(result),
            _ => None,
        }
    }

    /// The error object for error responses
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            RpcMessage::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcMessage::Error { .. })
    }

    /// Serialize to a `serde_json::Value`
    pub fn to_value(&self) -> Value {
        match self {
            RpcMessage::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            RpcMessage::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            RpcMessage::Response { id, result } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            RpcMessage::Error { id, error } => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".to_string(), json!("2.0"));
                if let Some(id) = id {
                    obj.insert("id".to_string(), json!(id));
                }
                obj.insert(
                    "error".to_string(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
                Value::Object(obj)
            }
        }
    }

    /// Serialize to a JSON byte vector
    pub fn to_bytes(&self) -> VolleyResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Parse a message from a `serde_json::Value`
    ///
    /// Shape detection: a `method` key makes a request (with `id`) or a
    /// notification (without); otherwise an `error` key makes an error and a
    /// `result` key a response.
    pub fn from_value(value: Value) -> VolleyResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(VolleyError::InvalidRpcMessage(
                "message is not a JSON object".to_string(),
            ));
        };

        let id = match obj.remove("id") {
            Some(v) => Some(
                serde_json::from_value::<RequestId>(v)
                    .map_err(|e| VolleyError::InvalidRpcMessage(format!("bad id: {}", e)))?,
            ),
            None => None,
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(VolleyError::InvalidRpcMessage(
                    "method is not a string".to_string(),
                ));
            };
            let params = normalize_params(obj.remove("params").unwrap_or(Value::Null));
            return Ok(match id {
                Some(id) => RpcMessage::Request { id, method, params },
                None => RpcMessage::Notification { method, params },
            });
        }

        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error)
                .map_err(|e| VolleyError::InvalidRpcMessage(format!("bad error object: {}", e)))?;
            return Ok(RpcMessage::Error { id, error });
        }

        if let Some(result) = obj.remove("result") {
            let id = id.ok_or_else(|| {
                VolleyError::InvalidRpcMessage("response without an id".to_string())
            })?;
            return Ok(RpcMessage::Response { id, result });
        }

        Err(VolleyError::InvalidRpcMessage(
            "message carries neither method, result, nor error".to_string(),
        ))
    }

    /// Parse a message from raw JSON bytes
    pub fn from_slice(bytes: &[u8]) -> VolleyResult<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }
}
