//! Typed request/response payloads carried in `Message::params`/`result`
//! (spec §6's recognized methods). Kept as small serde structs rather than
//! hand-parsing `serde_json::Value` at every call site — the tagged-variant
//! matcher design note (spec §9) applies to the dispatch *method*, not to
//! every payload shape, so plain structs are the idiomatic fit here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterParams {
    pub node_id: String,
    pub token: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResult {
    pub session_id: String,
    pub node_id: String,
    pub hub_version: String,
    pub connected_count: usize,
    pub known_tool_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListParams {
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingParams {
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongResult {
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodesResult {
    pub peers: Vec<mesh_core::PeerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsResult {
    pub tools: Vec<ToolSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub provider_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResult {
    pub connected_peers: usize,
    pub known_tools: usize,
    pub uptime_s: u64,
    pub calls_routed: u64,
    pub calls_failed: u64,
    pub broadcasts_sent: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastParams {
    pub payload: Value,
    /// Restricts delivery to these peer ids (spec §4.5 `multicast(targets)`
    /// folded into `mesh/broadcast`'s recognized wire method, since §6 lists
    /// no separate `multicast` method name).
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResult {
    pub attempted: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteParams {
    pub target: String,
    pub message: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeParams {
    pub node_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeResult {
    pub node_id: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializeResult {
    pub protocol_version: &'static str,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: &'static str,
    pub version: &'static str,
}

pub const PROTOCOL_VERSION: &str = "2024-11-05";
