//! Self-loop for locally-hosted tools: a synthetic Peer Table entry for
//! this node's own id, whose transport feeds a task that calls the
//! configured `ToolExecutor` directly and resolves the waiter without a
//! wire round trip. This lets `tools/call` dispatch (selection via the
//! Tool Index, in-flight bookkeeping, timeout/await) work identically
//! whether the eventual provider is local or remote.

use std::sync::Arc;

use mesh_core::wire::methods;
use mesh_core::{CallOutcome, MeshError, Message, Peer, PeerState, TransportHandle};
use serde_json::Value;

use crate::state::PeerControllerState;

/// Install the self-loop if this node's executor advertises any tools.
/// No-op otherwise — a pure relay node never gets a self entry.
pub fn install(state: &Arc<PeerControllerState>) {
    let tools = state.executor.tool_names();
    if tools.is_empty() {
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(64);
    let mut peer = Peer::new(state.self_node_id.clone(), state.config.hostname.clone());
    peer.state = PeerState::Connected;
    peer.advertised_tools = tools.clone();
    peer.transport_in = Some(TransportHandle {
        tx,
        generation: state.next_generation(),
        closer: Arc::new(tokio::sync::Notify::new()),
    });
    state.peers.upsert(peer);
    state.tools.register_additive(&state.self_node_id, &tools);
    tracing::info!(tools = ?tools, "local tool executor registered via self-loop");

    let loop_state = Arc::clone(state);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let loop_state = Arc::clone(&loop_state);
            tokio::spawn(async move { serve_one(loop_state, msg).await });
        }
    });
}

#[derive(serde::Deserialize)]
struct LocalCallParams {
    name: String,
    #[serde(default)]
    args: Value,
}

async fn serve_one(state: Arc<PeerControllerState>, msg: Message) {
    let Some(id_str) = msg.id_str() else {
        tracing::warn!("self-loop received a message with no request id, dropping");
        return;
    };
    let Ok(request_id) = id_str.parse::<u64>() else {
        tracing::warn!(id = %id_str, "self-loop received a non-numeric request id, dropping");
        return;
    };

    if msg.method.as_deref() != Some(methods::TOOLS_CALL) {
        let method = msg.method.unwrap_or_default();
        let _ = state
            .pending
            .resolve(request_id, CallOutcome::Error(MeshError::MethodNotFound(method)))
            .await;
        return;
    }

    let params = msg.params.unwrap_or(Value::Null);
    let call: LocalCallParams = match serde_json::from_value(params) {
        Ok(c) => c,
        Err(e) => {
            let _ = state
                .pending
                .resolve(request_id, CallOutcome::Error(MeshError::MalformedEnvelope(e.to_string())))
                .await;
            return;
        }
    };

    let outcome = match state.executor.invoke(&call.name, call.args).await {
        Ok(v) => CallOutcome::Result(v),
        Err(e) => CallOutcome::Error(e),
    };
    let _ = state.pending.resolve(request_id, outcome).await;
}
