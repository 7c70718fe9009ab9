//! Health surface: the `/health` HTTP endpoint (same shape as the Hub's,
//! `mesh-hub/src/health.rs`) plus the active ping loop that is this
//! controller's half of spec §4.6 "Health": every `ping_interval_s`, ping
//! each connected neighbor with a `ping_timeout_s` deadline; a failed probe
//! demotes the peer to `Failed` (distinct from the passive heartbeat-sweep
//! `Offline`, spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use mesh_core::wire::methods;
use mesh_core::{Message, PeerState};
use serde::Serialize;

use crate::state::PeerControllerState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    connected_peers: usize,
    known_tools: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<PeerControllerState>>) -> Json<HealthResponse> {
    // spec §6: "status is ok if at least one peer (or the hub itself) is
    // Connected, else degraded" — a dialed-out hub link lives in the same
    // Peer Table as any other neighbor, so `connected_count` already covers
    // both cases uniformly.
    let connected_peers = state.peers.connected_count();
    let status = if connected_peers > 0 { "ok" } else { "degraded" };
    Json(HealthResponse {
        status,
        node_id: state.self_node_id.clone(),
        connected_peers,
        known_tools: state.tools.len(),
        uptime_secs: state.uptime_secs(),
    })
}

pub fn router(state: Arc<PeerControllerState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Run the active ping loop until the process exits.
pub async fn run_ping_loop(state: Arc<PeerControllerState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.ping_interval_s));
    loop {
        ticker.tick().await;
        for peer_id in state.peers.ids() {
            if peer_id == state.self_node_id {
                continue; // the self-loop entry never needs a network probe
            }
            let state = Arc::clone(&state);
            tokio::spawn(async move { ping_one(state, peer_id).await });
        }
    }
}

async fn ping_one(state: Arc<PeerControllerState>, peer_id: String) {
    let Some(peer) = state.peers.get(&peer_id) else { return };
    let Some(transport) = peer.usable_transport() else { return };

    let request_id = state.pending.next_request_id();
    let rx = state.pending.install(request_id, peer_id.clone(), None).await;
    let ping = Message::request(request_id as i64, methods::PING, serde_json::json!({}));
    if transport.tx.send(ping).await.is_err() {
        state.pending.remove(request_id).await;
        mark_failed(&state, &peer_id);
        return;
    }

    let outcome = state
        .pending
        .await_with_timeout(request_id, rx, Duration::from_secs(state.config.ping_timeout_s))
        .await;
    match outcome {
        Ok(_) => {
            state.peers.record_ping(&peer_id);
            // A successful probe after a Failed/Offline spell promotes the
            // peer back to Connected; restore its Tool Index entry (I1).
            if let Some(peer) = state.peers.get(&peer_id) {
                if peer.state == PeerState::Connected && !peer.advertised_tools.is_empty() {
                    state.tools.register_additive(&peer_id, &peer.advertised_tools);
                }
            }
        }
        Err(_) => mark_failed(&state, &peer_id),
    }
}

/// spec §4.6: "failure sets state=Failed and closes the transport." Closing
/// forces the owning connection task's read/write loop to exit, which runs
/// `reconcile_disconnect` and lets `dial_forever`'s backoff loop redial —
/// without this, a peer that failed its probe would sit marked Failed
/// forever with its old (already unresponsive) transport still installed.
fn mark_failed(state: &Arc<PeerControllerState>, peer_id: &str) {
    let closed = state
        .peers
        .mutate(peer_id, |p| {
            let was_failed = p.state == PeerState::Failed;
            p.state = PeerState::Failed;
            if let Some(t) = p.transport_in.as_ref() {
                t.force_close();
            }
            if let Some(t) = p.transport_out.as_ref() {
                t.force_close();
            }
            !was_failed
        })
        .unwrap_or(false);
    if closed {
        tracing::warn!(peer_id, "health ping failed, peer marked Failed and transport closed");
        state.tools.remove_peer(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{NullExecutor, Peer, TransportHandle};

    fn test_state() -> (tempfile::TempDir, Arc<PeerControllerState>) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(mesh_vault::Vault::open(dir.path().join("vault.json")).unwrap());
        let config = {
            use clap::Parser;
            crate::config::PeerConfig::parse_from(["mesh-peer", "--node-id", "self", "--token", "t"])
        };
        (dir, Arc::new(PeerControllerState::new(config, "self".into(), vault, Arc::new(NullExecutor))))
    }

    fn handle() -> (TransportHandle, Arc<tokio::sync::Notify>) {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let closer = Arc::new(tokio::sync::Notify::new());
        (
            TransportHandle {
                tx,
                generation: 1,
                closer: Arc::clone(&closer),
            },
            closer,
        )
    }

    /// spec §4.6: a failed health probe must set `state=Failed` *and* close
    /// the transport, so the connection task's loop exits and the dial
    /// loop can redial rather than leaving a dead link installed forever.
    #[tokio::test]
    async fn mark_failed_sets_state_and_closes_transport() {
        let (_dir, state) = test_state();
        let mut peer = Peer::new("p1".into(), "p1.local".into());
        peer.state = PeerState::Connected;
        let (transport, closer) = handle();
        peer.transport_out = Some(transport);
        state.peers.upsert(peer);
        state.tools.register_additive("p1", &["echo".to_string()]);

        let woken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&woken);
        tokio::spawn(async move {
            closer.notified().await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        mark_failed(&state, "p1");
        tokio::task::yield_now().await;

        assert_eq!(state.peers.get("p1").unwrap().state, PeerState::Failed);
        assert!(woken.load(std::sync::atomic::Ordering::SeqCst), "transport must be force-closed");
        assert_eq!(state.tools.provider_count("echo"), 0);
    }

    #[tokio::test]
    async fn mark_failed_is_idempotent_on_already_failed_peer() {
        let (_dir, state) = test_state();
        let mut peer = Peer::new("p1".into(), "p1.local".into());
        peer.state = PeerState::Failed;
        state.peers.upsert(peer);

        mark_failed(&state, "p1");
        assert_eq!(state.peers.get("p1").unwrap().state, PeerState::Failed);
    }
}
