//! Request/notification handlers for the Peer Controller (spec §6's
//! recognized methods), generalized from `mesh-hub/src/dispatch.rs` with
//! the two things a hub never needs: multi-hop `mesh/route` forwarding and
//! a `tools/call` path that may land on this node's own `ToolExecutor` via
//! the self-loop peer entry (`local.rs`) — which needs no special case
//! here since the self-loop peer sits in the Peer Table like any other.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::wire::methods;
use mesh_core::{CallOutcome, MeshError, Message, PeerState};
use serde_json::Value;

use crate::protocol::*;
use crate::state::PeerControllerState;

/// Dispatch any message other than the initial `node/register`/
/// `peer/handshake` (already handled by `connection.rs`/`dial.rs` before a
/// link is considered live). Returns `Some(Message)` for requests that
/// need a reply; `None` for notifications and for responses routed to the
/// Pending-Call Table instead of handled here.
pub async fn dispatch(state: &Arc<PeerControllerState>, from_peer_id: &str, msg: Message) -> Option<Message> {
    if msg.is_response() {
        route_response(state, msg).await;
        return None;
    }

    let method = msg.method.clone().unwrap_or_default();
    let id = msg.id.clone();
    let params = msg.params.clone().unwrap_or(Value::Null);

    let result = match method.as_str() {
        methods::PING => handle_ping(state, from_peer_id, params),
        methods::MESH_NODES => handle_nodes(state),
        methods::MESH_TOOLS => handle_tools(state),
        methods::MESH_STATS => handle_stats(state),
        methods::TOOLS_LIST => handle_tools_list(state, from_peer_id, params),
        methods::TOOLS_CALL => handle_tools_call(state, from_peer_id, params).await,
        methods::MESH_BROADCAST => handle_broadcast(state, from_peer_id, params),
        methods::MESH_ROUTE => handle_route(state, from_peer_id, params).await,
        methods::PEER_HANDSHAKE => handle_peer_handshake(state, from_peer_id, params),
        methods::PEER_GOSSIP => {
            handle_peer_gossip(state, params);
            return None; // notification, no response expected
        }
        methods::INITIALIZE => handle_initialize(),
        other => Err(MeshError::MethodNotFound(other.to_string())),
    };

    if msg.id.is_none() {
        if let Err(e) = result {
            tracing::warn!(method = %method, error = %e, "notification handling failed");
        }
        return None;
    }

    let id = id?;
    Some(match result {
        Ok(value) => Message::response(id, value),
        Err(e) => Message::error_response(Some(id), e.into()),
    })
}

fn handle_ping(state: &PeerControllerState, from_peer_id: &str, _params: Value) -> Result<Value, MeshError> {
    state.peers.record_ping(from_peer_id);
    // Mirrors mesh-hub's handle_ping: restore the Tool Index entry a
    // previous Offline demotion removed (I1, spec §8 scenario 5).
    if let Some(peer) = state.peers.get(from_peer_id) {
        if peer.state == PeerState::Connected && !peer.advertised_tools.is_empty() {
            state.tools.register_additive(from_peer_id, &peer.advertised_tools);
        }
    }
    let pong = PongResult { ts: mesh_core::envelope::now_unix() };
    Ok(serde_json::to_value(pong).expect("PongResult serializes"))
}

fn handle_nodes(state: &PeerControllerState) -> Result<Value, MeshError> {
    let result = NodesResult {
        peers: state.peers.all_summaries(),
        known_peers: state.known.all(),
    };
    Ok(serde_json::to_value(result).expect("NodesResult serializes"))
}

fn handle_tools(state: &PeerControllerState) -> Result<Value, MeshError> {
    let tools = state
        .tools
        .tool_names()
        .into_iter()
        .map(|name| {
            let provider_count = state.tools.provider_count(&name);
            ToolSummary { name, provider_count }
        })
        .collect();
    Ok(serde_json::to_value(ToolsResult { tools }).expect("ToolsResult serializes"))
}

fn handle_stats(state: &PeerControllerState) -> Result<Value, MeshError> {
    let stats = StatsResult {
        connected_peers: state.peers.connected_count(),
        known_tools: state.tools.len(),
        known_peers: state.known.all().len(),
        uptime_s: state.uptime_secs(),
        calls_routed: state.calls_routed.load(Ordering::Relaxed),
        calls_failed: state.calls_failed.load(Ordering::Relaxed),
        broadcasts_sent: state.broadcasts_sent.load(Ordering::Relaxed),
        routes_forwarded: state.routes_forwarded.load(Ordering::Relaxed),
    };
    Ok(serde_json::to_value(stats).expect("StatsResult serializes"))
}

/// `tools/list` is full-replacement (spec §9), same rule as the Hub.
fn handle_tools_list(state: &PeerControllerState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: ToolsListParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    state.tools.replace(from_peer_id, &params.tools);
    state.peers.mutate(from_peer_id, |p| p.advertised_tools = params.tools.clone());
    Ok(Value::Null)
}

/// Route a `tools/call` to whichever peer the Tool Index selects — which
/// may be the self-loop entry installed by `local.rs` for this node's own
/// tools, a directly-connected tool-provider, or a federated neighbor; the
/// selection and forwarding code does not need to know which.
async fn handle_tools_call(state: &Arc<PeerControllerState>, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: ToolsCallParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;

    let target = match &params.target_node {
        Some(node_id) => {
            if !state.peers.contains(node_id) {
                return Err(MeshError::NoSuchTarget(node_id.clone()));
            }
            node_id.clone()
        }
        None => state
            .tools
            .select(&params.name, &state.peers)
            .ok_or_else(|| MeshError::NoProvider(params.name.clone()))?,
    };

    let peer = state.peers.get(&target).ok_or_else(|| MeshError::NoSuchTarget(target.clone()))?;
    let transport = peer.usable_transport().ok_or_else(|| MeshError::NoSuchTarget(target.clone()))?;

    let request_id = state.pending.next_request_id();
    let rx = state.pending.install(request_id, target.clone(), Some(from_peer_id.to_string())).await;

    let forwarded = Message::request(
        request_id as i64,
        methods::TOOLS_CALL,
        serde_json::json!({ "name": params.name, "args": params.args }),
    );
    if transport.tx.send(forwarded).await.is_err() {
        state.pending.remove(request_id).await;
        state.calls_failed.fetch_add(1, Ordering::Relaxed);
        return Err(MeshError::TargetUnreachable);
    }

    // Permanent routing counter, not an in-flight gauge (spec §8 scenario 3:
    // "After completion, P1.request_count=3. Next identical call picks
    // P2." — it never goes back down).
    state.peers.mutate(&target, |p| p.request_count += 1);

    let timeout = params.timeout_s.map(Duration::from_secs).unwrap_or(mesh_core::DEFAULT_CALL_TIMEOUT);
    let outcome = state.pending.await_with_timeout(request_id, rx, timeout).await;

    match outcome {
        Ok(v) => {
            state.calls_routed.fetch_add(1, Ordering::Relaxed);
            Ok(v)
        }
        Err(e) => {
            state.calls_failed.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// A response-shaped message arriving from a peer: resolve whichever
/// waiter (a `tools/call` or a relayed `mesh/route`) it answers. Unknown
/// ids are logged and dropped (spec §4.4: never throws).
async fn route_response(state: &PeerControllerState, msg: Message) {
    let Some(id_str) = msg.id_str() else { return };
    let Ok(request_id) = id_str.parse::<u64>() else {
        tracing::warn!(id = %id_str, "response with non-numeric id, dropping");
        return;
    };
    let outcome = if let Some(err) = msg.error {
        CallOutcome::Error(MeshError::Internal(err.message))
    } else {
        CallOutcome::Result(msg.result.unwrap_or(Value::Null))
    };
    if !state.pending.resolve(request_id, outcome).await {
        tracing::debug!(request_id, "spurious response for unknown request id, dropping");
    }
}

/// Best-effort fan-out (spec §4.5/§4.6). `try_send` so a slow or stalled
/// peer never blocks the broadcaster or the other recipients.
fn handle_broadcast(state: &PeerControllerState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: BroadcastParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    let ttl = params.ttl.unwrap_or(state.config.broadcast_default_ttl);
    if ttl == 0 {
        return Ok(serde_json::to_value(BroadcastResult { attempted: 0 }).unwrap());
    }
    let origin = params.origin.unwrap_or_else(|| from_peer_id.to_string());

    let targets: Vec<String> = match params.targets {
        Some(ids) => ids,
        None => state.peers.ids(),
    };

    let mut attempted = 0usize;
    for peer_id in targets {
        if peer_id == from_peer_id || peer_id == state.self_node_id {
            continue;
        }
        let Some(peer) = state.peers.get(&peer_id) else { continue };
        if matches!(peer.state, PeerState::Offline | PeerState::Disconnected | PeerState::Failed) {
            continue;
        }
        let Some(transport) = peer.usable_transport() else { continue };
        let notification = Message::notification(
            methods::MESH_BROADCAST,
            serde_json::json!({ "payload": params.payload, "ttl": ttl - 1, "origin": origin }),
        );
        if transport.tx.try_send(notification).is_ok() {
            attempted += 1;
        }
    }
    state.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    Ok(serde_json::to_value(BroadcastResult { attempted }).expect("BroadcastResult serializes"))
}

#[derive(serde::Deserialize)]
struct InnerMessage {
    method: String,
    #[serde(default)]
    params: Value,
}

/// `mesh/route{target, message}`: direct-neighbor-only forwarding (spec
/// §4.6). If `target` is this node, the message is delivered to our own
/// dispatcher as a notification. If it is a directly-connected neighbor,
/// it is forwarded straight there. Otherwise the same route request is
/// relayed, one candidate at a time, to every other connected neighbor
/// except `origin` — there is no hop counter, so a route that cannot reach
/// `target` in one or two hops from here simply exhausts its candidates
/// and returns `NoRoute` rather than looping forever (see DESIGN.md).
async fn handle_route(state: &Arc<PeerControllerState>, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: RouteParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    let origin = params.origin.clone().unwrap_or_else(|| from_peer_id.to_string());

    if params.target == state.self_node_id {
        match serde_json::from_value::<InnerMessage>(params.message) {
            Ok(inner) => {
                let notification = Message::notification(inner.method, inner.params);
                Box::pin(dispatch(state, from_peer_id, notification)).await;
            }
            Err(e) => tracing::warn!(error = %e, "mesh/route delivered a malformed inner message"),
        }
        return Ok(Value::Null);
    }

    let mut candidates: Vec<String> = Vec::new();
    if state.peers.contains(&params.target) {
        candidates.push(params.target.clone());
    }
    for peer_id in state.peers.ids() {
        if peer_id != params.target && peer_id != origin && peer_id != from_peer_id {
            candidates.push(peer_id);
        }
    }

    for peer_id in candidates {
        let Some(peer) = state.peers.get(&peer_id) else { continue };
        if !matches!(peer.state, PeerState::Connected | PeerState::Degraded) {
            continue;
        }
        let Some(transport) = peer.usable_transport() else { continue };

        let request_id = state.pending.next_request_id();
        let rx = state.pending.install(request_id, peer_id.clone(), Some(from_peer_id.to_string())).await;
        let forwarded = Message::request(
            request_id as i64,
            methods::MESH_ROUTE,
            serde_json::json!({ "target": params.target, "message": params.message, "origin": origin }),
        );
        if transport.tx.send(forwarded).await.is_err() {
            state.pending.remove(request_id).await;
            continue;
        }
        let outcome = state.pending.await_with_timeout(request_id, rx, Duration::from_secs(5)).await;
        if outcome.is_ok() {
            state.routes_forwarded.fetch_add(1, Ordering::Relaxed);
            return Ok(Value::Null);
        }
    }

    Err(MeshError::NoRoute(params.target.clone()))
}

/// `peer/handshake` arriving after the connection is already live (a
/// neighbor re-announcing its tool set). The accept-gate handles the
/// first handshake; this keeps the advertised set current afterward.
fn handle_peer_handshake(state: &PeerControllerState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: HandshakeParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    state.tools.register_additive(from_peer_id, &params.tools);
    state.peers.mutate(from_peer_id, |p| p.advertised_tools = params.tools.clone());
    Ok(serde_json::to_value(HandshakeResult {
        node_id: state.self_node_id.clone(),
        tools: state.tools.tool_names(),
    })
    .expect("HandshakeResult serializes"))
}

/// `peer/gossip`: merge the sender's known-peers records (idempotent merge,
/// spec §4.6/§8 "Idempotence"). `gossip.rs`'s periodic task is what
/// actually dials newly-learned peers; this handler only updates the table.
fn handle_peer_gossip(state: &PeerControllerState, params: Value) {
    match serde_json::from_value::<GossipParams>(params) {
        Ok(p) => {
            let merged = state.known.merge_all(p.peers);
            tracing::debug!(merged, "merged gossip records");
        }
        Err(e) => tracing::warn!(error = %e, "malformed peer/gossip payload"),
    }
}

fn handle_initialize() -> Result<Value, MeshError> {
    Ok(serde_json::to_value(InitializeResult {
        protocol_version: PROTOCOL_VERSION,
        server_info: ServerInfo { name: "mesh-peer", version: crate::state::PEER_VERSION },
    })
    .expect("InitializeResult serializes"))
}
