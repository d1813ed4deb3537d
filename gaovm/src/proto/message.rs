//! JSON-RPC 2.0 message model.
//!
//! Requests carry an `id` and are answered; notifications carry none and are
//! not. Responses are either `{id, result}` or `{id, error}`. Request IDs are
//! signed so the daemon's driver-directed requests (descending negative) can
//! never collide with client requests (ascending positive).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used on the wire. The first five are standard JSON-RPC; the
/// −3201x range is specific to this protocol.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const HANDSHAKE_FAILED: i64 = -32010;
    pub const AUTH_FAILED: i64 = -32011;
    pub const CAPABILITY_MISMATCH: i64 = -32012;
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> RpcError {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> RpcError {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> RpcError {
        RpcError::new(code::METHOD_NOT_FOUND, format!("unknown method {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> RpcError {
        RpcError::new(code::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> RpcError {
        RpcError::new(code::INTERNAL_ERROR, message)
    }

    pub fn handshake_required() -> RpcError {
        RpcError::new(code::HANDSHAKE_FAILED, "handshake has not completed")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: i64,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: i64,
        result: Value,
    },
    Error {
        id: i64,
        error: RpcError,
    },
}

impl RpcMessage {
    /// Classify a decoded frame. The frame codec guarantees `value` is a JSON
    /// object; everything else about its shape is checked here.
    pub fn classify(value: Value) -> Result<RpcMessage, RpcError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::new(code::INVALID_REQUEST, "message is not an object"))?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(RpcError::new(
                code::INVALID_REQUEST,
                "missing or unsupported jsonrpc version",
            ));
        }

        let id = match obj.get("id") {
            None => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                RpcError::new(code::INVALID_REQUEST, "id must be an integer")
            })?),
        };

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| RpcError::new(code::INVALID_REQUEST, "method must be a string"))?
                .to_owned();
            let params = obj.get("params").cloned();
            return Ok(match id {
                Some(id) => RpcMessage::Request { id, method, params },
                None => RpcMessage::Notification { method, params },
            });
        }

        let id =
            id.ok_or_else(|| RpcError::new(code::INVALID_REQUEST, "response without an id"))?;
        if let Some(error) = obj.get("error") {
            let error: RpcError = serde_json::from_value(error.clone())
                .map_err(|_| RpcError::new(code::INVALID_REQUEST, "malformed error object"))?;
            return Ok(RpcMessage::Error { id, error });
        }
        match obj.get("result") {
            Some(result) => Ok(RpcMessage::Response {
                id,
                result: result.clone(),
            }),
            None => Err(RpcError::new(
                code::INVALID_REQUEST,
                "message has neither method, result nor error",
            )),
        }
    }
}

/// Build an outbound request frame value.
pub fn request(id: i64, method: &str, params: Option<&Value>) -> Value {
    let mut msg = json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method});
    if let Some(params) = params {
        msg["params"] = params.clone();
    }
    msg
}

/// Build an outbound notification frame value.
pub fn notification(method: &str, params: Option<&Value>) -> Value {
    let mut msg = json!({"jsonrpc": JSONRPC_VERSION, "method": method});
    if let Some(params) = params {
        msg["params"] = params.clone();
    }
    msg
}

/// Build a success response frame value.
pub fn response(id: i64, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

/// Build an error response frame value.
pub fn error_response(id: i64, error: &RpcError) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request_notification_response_error() {
        let req = RpcMessage::classify(request(3, "ping", None)).unwrap();
        assert_eq!(
            req,
            RpcMessage::Request {
                id: 3,
                method: "ping".into(),
                params: None
            }
        );

        let note =
            RpcMessage::classify(notification("event", Some(&json!({"type": "t"})))).unwrap();
        assert!(matches!(note, RpcMessage::Notification { method, .. } if method == "event"));

        let ok = RpcMessage::classify(response(-4, json!({"ok": true}))).unwrap();
        assert!(matches!(ok, RpcMessage::Response { id: -4, .. }));

        let err = RpcMessage::classify(error_response(
            7,
            &RpcError::new(code::METHOD_NOT_FOUND, "unknown method nope"),
        ))
        .unwrap();
        match err {
            RpcMessage::Error { id, error } => {
                assert_eq!(id, 7);
                assert_eq!(error.code, code::METHOD_NOT_FOUND);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let msg = json!({"jsonrpc": "1.0", "id": 1, "method": "ping"});
        let err = RpcMessage::classify(msg).unwrap_err();
        assert_eq!(err.code, code::INVALID_REQUEST);
    }

    #[test]
    fn rejects_shapeless_object() {
        let msg = json!({"jsonrpc": "2.0", "id": 1});
        assert!(RpcMessage::classify(msg).is_err());
    }

    #[test]
    fn error_data_roundtrips() {
        let error = RpcError::new(code::CAPABILITY_MISMATCH, "capability mismatch")
            .with_data(json!({"missing": ["ping"]}));
        let value = serde_json::to_value(&error).unwrap();
        let back: RpcError = serde_json::from_value(value).unwrap();
        assert_eq!(back, error);
    }
}
