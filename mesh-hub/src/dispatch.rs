//! Request/notification handlers for the Hub Controller (spec §6's
//! recognized methods). One function per method, called from
//! `connection.rs`'s read loop once a node has passed `node/register`.
//!
//! Grounded on `freeq-server/src/s2s.rs`'s `handle_s2s_message` match-on-
//! method dispatcher: each arm owns its own error mapping back to an
//! `RpcError`, so a bad call never takes down the connection.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::wire::methods;
use mesh_core::{CallOutcome, MeshError, Message, PeerState};
use mesh_vault::VerifyOutcome;
use serde_json::Value;

use crate::protocol::*;
use crate::state::HubState;

/// Validate a `node/register` request against the Federation Vault (spec
/// §4.1/§4.2). Does not touch the peer table — `connection.rs` owns
/// installing the transport and force-closing any stale one (I6), since
/// only it has the new `TransportHandle` to insert.
pub fn handle_register(
    state: &HubState,
    req_id: Value,
    params: Value,
    client_ip: Option<&str>,
) -> Result<(RegisterParams, Message), MeshError> {
    let params: RegisterParams = serde_json::from_value(params)
        .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;

    match state.vault.verify(&params.node_id, &params.token, client_ip) {
        VerifyOutcome::Valid => {}
        VerifyOutcome::UnknownNode => return Err(MeshError::UnknownNode(params.node_id)),
        VerifyOutcome::Revoked => return Err(MeshError::Revoked(params.node_id)),
        VerifyOutcome::IpNotAllowed => return Err(MeshError::IpNotAllowed(params.node_id)),
        VerifyOutcome::BadToken => return Err(MeshError::UnknownNode(params.node_id)),
    }

    let accepted = AcceptedResult {
        session_id: state.next_session_id(),
        node_id: params.node_id.clone(),
        hub_version: crate::state::HUB_VERSION.to_string(),
        connected_count: state.peers.connected_count(),
        known_tool_count: state.tools.len(),
    };
    let response = Message::response(
        req_id,
        serde_json::to_value(accepted).expect("AcceptedResult serializes"),
    );
    Ok((params, response))
}

/// Dispatch any message other than `node/register` (already handled by the
/// caller before the connection is considered live). Returns `Some(Message)`
/// to send back for requests; `None` for notifications and for responses
/// that were routed to the pending-call table instead of handled here.
pub async fn dispatch(
    state: &Arc<HubState>,
    from_peer_id: &str,
    msg: Message,
) -> Option<Message> {
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
        methods::MESH_ROUTE => handle_route(state, params),
        methods::PEER_HANDSHAKE => handle_peer_handshake(state, from_peer_id, params),
        methods::PEER_GOSSIP => {
            handle_peer_gossip(state, params);
            return None; // notification, no response expected
        }
        methods::INITIALIZE => handle_initialize(),
        other => Err(MeshError::MethodNotFound(other.to_string())),
    };

    if msg.id.is_none() {
        // Notification: log failures, never reply (spec §6).
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

fn handle_ping(state: &HubState, from_peer_id: &str, _params: Value) -> Result<Value, MeshError> {
    state.peers.record_ping(from_peer_id);
    // record_ping promotes Degraded/Offline back to Connected (spec §4.5);
    // an Offline promotion had its tools dropped from the index by the
    // heartbeat reaper (I1), so re-register from the peer's own advertised
    // list to restore it (spec §8 scenario 5: "tool index restored").
    if let Some(peer) = state.peers.get(from_peer_id) {
        if peer.state == PeerState::Connected && !peer.advertised_tools.is_empty() {
            state.tools.register_additive(from_peer_id, &peer.advertised_tools);
        }
    }
    let pong = PongResult { ts: mesh_core::envelope::now_unix() };
    Ok(serde_json::to_value(pong).expect("PongResult serializes"))
}

fn handle_nodes(state: &HubState) -> Result<Value, MeshError> {
    let result = NodesResult { peers: state.peers.all_summaries() };
    Ok(serde_json::to_value(result).expect("NodesResult serializes"))
}

fn handle_tools(state: &HubState) -> Result<Value, MeshError> {
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

fn handle_stats(state: &HubState) -> Result<Value, MeshError> {
    let stats = StatsResult {
        connected_peers: state.peers.connected_count(),
        known_tools: state.tools.len(),
        uptime_s: state.uptime_secs(),
        calls_routed: state.calls_routed.load(std::sync::atomic::Ordering::Relaxed),
        calls_failed: state.calls_failed.load(std::sync::atomic::Ordering::Relaxed),
        broadcasts_sent: state.broadcasts_sent.load(std::sync::atomic::Ordering::Relaxed),
    };
    Ok(serde_json::to_value(stats).expect("StatsResult serializes"))
}

/// `tools/list` is full-replacement (spec §9): the calling node's entire
/// advertised set is swapped in, not merged with whatever it sent before.
fn handle_tools_list(state: &HubState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: ToolsListParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    state.tools.replace(from_peer_id, &params.tools);
    state.peers.mutate(from_peer_id, |p| p.advertised_tools = params.tools.clone());
    Ok(Value::Null)
}

/// Route a `tools/call` to whichever connected peer the Tool Index selects
/// (spec §4.3/§4.4). Reserves a fresh downstream request id, installs a
/// waiter, forwards to the provider's transport, and awaits the reply —
/// all inside this one request's handling, so `connection.rs` never needs
/// to know the call crossed a second hop.
async fn handle_tools_call(state: &Arc<HubState>, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
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
    let rx = state
        .pending
        .install(request_id, target.clone(), Some(from_peer_id.to_string()))
        .await;

    let forwarded = Message::request(
        request_id as i64,
        methods::TOOLS_CALL,
        serde_json::json!({ "name": params.name, "args": params.args }),
    );
    if transport.tx.send(forwarded).await.is_err() {
        state.pending.remove(request_id).await;
        state.calls_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Err(MeshError::TargetUnreachable);
    }

    // Permanent routing counter, not an in-flight gauge (spec §8 scenario 3:
    // "After completion, P1.request_count=3. Next identical call picks
    // P2." — it never goes back down).
    state.peers.mutate(&target, |p| p.request_count += 1);

    let timeout = params
        .timeout_s
        .map(Duration::from_secs)
        .unwrap_or(mesh_core::DEFAULT_CALL_TIMEOUT);
    let outcome = state.pending.await_with_timeout(request_id, rx, timeout).await;

    match outcome {
        Ok(v) => {
            state.calls_routed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(v)
        }
        Err(e) => {
            state.calls_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(e)
        }
    }
}

/// A response-shaped message (carries `result`/`error`, no `method`)
/// arriving from a peer: resolve whichever `tools/call` waiter it answers.
/// Unknown ids are logged and dropped (spec §4.4: never throws).
async fn route_response(state: &HubState, msg: Message) {
    let Some(id_str) = msg.id_str() else { return };
    let Ok(request_id) = id_str.parse::<u64>() else {
        tracing::warn!(id = %id_str, "response with non-numeric id, dropping");
        return;
    };
    let outcome = if let Some(err) = msg.error {
        CallOutcome::Error(rpc_error_to_mesh(err))
    } else {
        CallOutcome::Result(msg.result.unwrap_or(Value::Null))
    };
    if !state.pending.resolve(request_id, outcome).await {
        tracing::debug!(request_id, "spurious response for unknown request id, dropping");
    }
}

fn rpc_error_to_mesh(err: mesh_core::wire::RpcError) -> MeshError {
    MeshError::Internal(err.message)
}

/// Best-effort fan-out (spec §4.5 `broadcast(payload)` / `multicast(targets)`
/// folded into this one method). Uses `try_send` so a slow or stalled peer
/// never blocks the broadcaster or the other recipients; a full channel
/// drops this broadcast for that peer only.
fn handle_broadcast(state: &HubState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
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
        if peer_id == from_peer_id {
            continue;
        }
        let Some(peer) = state.peers.get(&peer_id) else { continue };
        if matches!(peer.state, PeerState::Offline | PeerState::Disconnected | PeerState::Failed) {
            continue;
        }
        let Some(transport) = peer.usable_transport() else { continue };
        let notification = Message::notification(
            methods::MESH_BROADCAST,
            serde_json::json!({
                "payload": params.payload,
                "ttl": ttl - 1,
                "origin": origin,
            }),
        );
        if transport.tx.try_send(notification).is_ok() {
            attempted += 1;
        }
    }
    state.broadcasts_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Ok(serde_json::to_value(BroadcastResult { attempted }).expect("BroadcastResult serializes"))
}

/// `mesh/route`: forward a message to a single, directly-connected target
/// (spec §4.6's multi-hop routing happens peer-to-peer, one hop at a time;
/// the hub only ever forwards to its own direct neighbors).
fn handle_route(state: &HubState, params: Value) -> Result<Value, MeshError> {
    let params: RouteParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    let peer = state
        .peers
        .get(&params.target)
        .ok_or_else(|| MeshError::NoRoute(params.target.clone()))?;
    let transport = peer
        .usable_transport()
        .ok_or_else(|| MeshError::NoRoute(params.target.clone()))?;
    let forwarded = Message::notification(methods::MESH_ROUTE, params.message);
    transport
        .tx
        .try_send(forwarded)
        .map_err(|_| MeshError::TargetUnreachable)?;
    Ok(Value::Null)
}

/// `peer/handshake`: a `mesh-peer` federating with this hub over the
/// signed-envelope link (spec §4.1). Bearer-token verification already
/// happened in `node/register`'s vault check on the same connection; this
/// just records the advertised tool set as a provider list entry.
fn handle_peer_handshake(state: &HubState, from_peer_id: &str, params: Value) -> Result<Value, MeshError> {
    let params: HandshakeParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    state.tools.register_additive(from_peer_id, &params.tools);
    Ok(serde_json::to_value(HandshakeResult {
        node_id: state.hub_node_id.clone(),
        tools: state.tools.tool_names(),
    })
    .expect("HandshakeResult serializes"))
}

/// `peer/gossip`: merge the sender's known-peers records (spec §4.6,
/// idempotent merge via `KnownPeers::merge_all`). Notification only, no
/// reply.
fn handle_peer_gossip(state: &HubState, params: Value) {
    #[derive(serde::Deserialize)]
    struct GossipParams {
        #[serde(default)]
        peers: Vec<mesh_core::GossipRecord>,
    }
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
        server_info: ServerInfo { name: "mesh-hub", version: crate::state::HUB_VERSION },
    })
    .expect("InitializeResult serializes"))
}
