//! Tool-call protocol, JSON-RPC style
//!
//! Wire format:
//!
//! Client → Server (RPC request):
//!   { "id": 7, "method": "process_update", "params": { "complexity": 0.4, "response_text": "..." } }
//!
//! Server → Client (RPC response):
//!   { "id": 7, "result": { "decision": { ... }, "metrics": { ... } } }
//!   { "id": 7, "error": { "code": -32010, "message": "...", "data": { "reason": "lock_timeout", "retryable": true } } }
//!
//! Server → Client (event push, no id):
//!   { "event": "lifecycle", "data": { "agent": "agent_20261014_a1b2c3", "kind": "loop_detected" } }

use crate::error::Error;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Unified incoming WebSocket message. Serde tries RPC first, then auth shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Rpc(RpcRequest),
    /// Auth shorthand: { "token": "..." }
    Auth { token: Option<String> },
}

// ---------------------------------------------------------------------------
// Server → Client: RPC response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Typed service error, with its machine-readable reason attached.
    pub fn from_error(id: serde_json::Value, error: &Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: error.rpc_code(),
                message: error.to_string(),
                data: Some(ErrorData {
                    reason: error.reason_code().to_string(),
                    retryable: error.is_retryable(),
                    retry_after_secs: error.retry_after_secs(),
                }),
            }),
        }
    }

    pub fn method_not_found(id: serde_json::Value, method: &str) -> Self {
        Self::from_error(id, &Error::MethodNotFound(method.to_string()))
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::err(serde_json::Value::Null, -32700, message)
    }

    pub fn auth_error(id: serde_json::Value, message: impl Into<String>) -> Self {
        Self::from_error(id, &Error::auth_failed(message))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    pub reason: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Server → Client: event push
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Lifecycle transition of an agent, addressed by display id.
    pub fn lifecycle(agent: &str, kind: &str, detail: Option<&str>) -> Self {
        Self::new(
            "lifecycle",
            serde_json::json!({ "agent": agent, "kind": kind, "detail": detail }),
        )
    }

    /// Dialectic session status change.
    pub fn dialectic(session: &str, status: &str) -> Self {
        Self::new(
            "dialectic",
            serde_json::json!({ "session": session, "status": status }),
        )
    }

    pub fn auth_result(ok: bool, error: Option<&str>) -> Self {
        Self::new("auth", serde_json::json!({ "ok": ok, "error": error }))
    }

    /// Sent on connection.
    pub fn info(version: &str, session: &str) -> Self {
        Self::new(
            "info",
            serde_json::json!({ "version": version, "session": session }),
        )
    }
}
