//! JSON-RPC-shaped wire messages exchanged between nodes.
//!
//! Every message on a transport is one `Message`: a request (has `id` and
//! `method`), a response (has `id` and `result`/`error`), or a notification
//! (has `method`, no `id`). `serde`'s untagged enum matches the shape the
//! same way `freeq-server`'s IRC line parser matches on which fields are
//! present rather than a type tag, because that is the wire format spec §6
//! mandates (JSON-RPC 2.0-ish, not a Rust-specific envelope).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Recognized method names (spec §6). Kept as string constants rather than
/// an exhaustive enum on the wire, since unknown methods must be rejected
/// with `MethodNotFound` rather than fail to parse.
pub mod methods {
    pub const NODE_REGISTER: &str = "node/register";
    pub const NODE_ACCEPTED: &str = "node/accepted";
    pub const PEER_HANDSHAKE: &str = "peer/handshake";
    pub const PEER_GOSSIP: &str = "peer/gossip";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const MESH_NODES: &str = "mesh/nodes";
    pub const MESH_TOOLS: &str = "mesh/tools";
    pub const MESH_BROADCAST: &str = "mesh/broadcast";
    pub const MESH_ROUTE: &str = "mesh/route";
    pub const MESH_STATS: &str = "mesh/stats";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    /// Surface-compatibility with MCP clients; not part of spec's routing
    /// logic (see SPEC_FULL.md §2 supplement).
    pub const INITIALIZE: &str = "initialize";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl From<crate::error::MeshError> for RpcError {
    fn from(e: crate::error::MeshError) -> Self {
        RpcError {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// A single JSON-RPC-shaped message. `id` absent ⇒ notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<Value>, error: RpcError) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// True if this message carries `result` or `error` — i.e. it answers a
    /// previously-sent request rather than initiating one.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Correlation id as a string, regardless of whether it was transmitted
    /// as a JSON number or string (both are legal JSON-RPC ids).
    pub fn id_str(&self) -> Option<String> {
        self.id.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn parse_line(line: &str) -> Result<Self, crate::error::MeshError> {
        serde_json::from_str(line)
            .map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))
    }

    pub fn to_line(&self) -> Result<String, crate::error::MeshError> {
        serde_json::to_string(self)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let msg = Message::request(1, methods::PING, json!({}));
        let line = msg.to_line().unwrap();
        let parsed = Message::parse_line(line.trim_end()).unwrap();
        assert_eq!(parsed.method.as_deref(), Some(methods::PING));
        assert_eq!(parsed.id_str(), Some("1".to_string()));
        assert!(!parsed.is_response());
        assert!(!parsed.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let msg = Message::notification(methods::PEER_GOSSIP, json!({"peers": []}));
        assert!(msg.is_notification());
        assert!(msg.id.is_none());
    }

    #[test]
    fn response_is_distinguished_from_request() {
        let resp = Message::response(json!(7), json!({"pong": true}));
        assert!(resp.is_response());
        assert!(!resp.is_notification());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = Message::parse_line("{not json").unwrap_err();
        assert!(matches!(err, crate::error::MeshError::MalformedEnvelope(_)));
    }
}
