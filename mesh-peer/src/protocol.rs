//! Typed request/response payloads carried in `Message::params`/`result`
//! for the Peer Controller (spec §6). Same shape discipline as
//! `mesh-hub/src/protocol.rs`: small serde structs per method rather than
//! hand-parsing `Value` at every call site.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `node/register` — a tool-provider (or any client) registering directly
/// with this peer, same as the Hub's register contract (spec §4.5, applied
/// here because a full peer node "additionally accept[s] direct
/// connections" per spec §1).
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
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResult {
    pub session_id: String,
    pub node_id: String,
    pub peer_version: String,
    pub connected_count: usize,
    pub known_tool_count: usize,
}

/// `peer/handshake` — symmetric identity + tool exchange between two peers
/// (spec §4.6). Carries a bearer token exactly like `node/register` (spec
/// §4.1: "Peer↔peer handshake also carries a bearer token").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeParams {
    pub node_id: String,
    pub token: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub node_id: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListParams {
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsCallParams {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongResult {
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodesResult {
    pub peers: Vec<mesh_core::PeerSummary>,
    pub known_peers: Vec<mesh_core::GossipRecord>,
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
    pub known_peers: usize,
    pub uptime_s: u64,
    pub calls_routed: u64,
    pub calls_failed: u64,
    pub broadcasts_sent: u64,
    pub routes_forwarded: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastParams {
    pub payload: Value,
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

/// `peer/gossip` — compact known-peer summaries (spec §4.6). Notification,
/// no response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GossipParams {
    #[serde(default)]
    pub peers: Vec<mesh_core::GossipRecord>,
}

/// `mesh/route{target, message}` (spec §4.6). `origin` defaults to the
/// immediate sender and is never forwarded back to it (direct-neighbor-only
/// forwarding rule). `message` is opaque and re-sent verbatim to whichever
/// neighbor ends up carrying it one hop closer to `target`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteParams {
    pub target: String,
    pub message: Value,
    #[serde(default)]
    pub origin: Option<String>,
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
