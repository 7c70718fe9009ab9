//! Per-connection accept handling: ALPN routing, the register gate, and
//! the read/dispatch loop once a node is live.
//!
//! Grounded on `freeq-server/src/iroh.rs`'s accept loop (`conn.alpn()`
//! routes between client and S2S handling) and `freeq-server/src/s2s.rs`'s
//! `handle_s2s_connection` (peer-table insert with generation tie-break,
//! then a read-loop task that feeds an event channel).

use std::sync::Arc;

use iroh::endpoint::Connection;
use mesh_core::identity::{MESH_ALPN, MESH_PEER_ALPN};
use mesh_core::transport::SignConfig;
use mesh_core::wire::methods;
use mesh_core::{MeshError, Message, Peer, PeerState, TransportHandle};

use crate::dispatch;
use crate::state::HubState;

/// Accept one incoming connection, routing by ALPN: plain for tool-provider
/// nodes, signed-envelope for federated `mesh-peer` links (spec §4.1: "every
/// server-to-server message is a signed envelope").
pub async fn handle_incoming(conn: Connection, state: Arc<HubState>) {
    let alpn = conn.alpn();
    let sign = if alpn == MESH_PEER_ALPN {
        match &state.config.shared_secret {
            Some(secret) => Some(SignConfig {
                secret: Arc::from(secret.as_str()),
                window_s: state.config.signed_envelope_window_s,
            }),
            None => {
                tracing::warn!("rejecting peer/1 connection: no shared secret configured");
                conn.close(1u32.into(), b"no shared secret configured");
                return;
            }
        }
    } else if alpn == MESH_ALPN {
        None
    } else {
        tracing::warn!(?alpn, "rejecting connection with unrecognized ALPN");
        conn.close(1u32.into(), b"unrecognized alpn");
        return;
    };

    if let Err(e) = handle_session(conn, state, true, sign).await {
        tracing::debug!(error = %e, "connection ended");
    }
}

/// Run one connection end to end: wait for `node/register` (spec I's
/// "first message must be register" rule), then loop on dispatch until the
/// transport closes.
async fn handle_session(
    conn: Connection,
    state: Arc<HubState>,
    incoming: bool,
    sign: Option<SignConfig>,
) -> anyhow::Result<()> {
    // iroh connections are authenticated by node identity, not source IP;
    // the Vault's `allowed_ips` check (spec §4.2) only ever sees `None` here,
    // which means allowlists configured on a node's record always fail
    // closed rather than silently passing (see DESIGN.md).
    let remote_ip: Option<String> = None;
    let generation = state.next_generation();
    let (link, mut inbound, joined) =
        mesh_core::transport::spawn(conn, incoming, generation, 256, sign).await?;

    let first = match inbound.recv().await {
        Some(msg) => msg,
        None => {
            joined.abort();
            return Ok(());
        }
    };

    if first.method.as_deref() != Some(methods::NODE_REGISTER) {
        tracing::warn!("first message was not node/register, closing");
        let err = Message::error_response(first.id, MeshError::NotRegistered.into());
        let _ = link.outbound.send(err).await;
        joined.abort();
        return Ok(());
    }

    let req_id = first.id.clone().unwrap_or(serde_json::Value::Null);
    let params = first.params.clone().unwrap_or(serde_json::Value::Null);
    let (reg_params, response) = match dispatch::handle_register(&state, req_id.clone(), params, remote_ip.as_deref()) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "node/register rejected");
            let err = Message::error_response(Some(req_id), e.into());
            let _ = link.outbound.send(err).await;
            joined.abort();
            return Ok(());
        }
    };
    let node_id = reg_params.node_id.clone();

    let transport_handle = TransportHandle {
        tx: link.outbound.clone(),
        generation: link.generation,
        closer: Arc::clone(&link.closer),
    };

    // I6: force-close a stale transport of the *same* direction before the
    // new one takes its place in the peer table. The other direction's
    // transport, if any, is a legitimate independent link (spec §8's
    // dual-transport scenario) and must be left alone.
    if let Some(prev) = state.peers.get(&node_id) {
        let stale = if incoming { prev.transport_in.as_ref() } else { prev.transport_out.as_ref() };
        if let Some(t) = stale.filter(|t| t.generation != transport_handle.generation) {
            t.force_close();
        }
    }

    let mut peer = Peer::new(node_id.clone(), reg_params.hostname.clone());
    peer.address = remote_ip.clone();
    peer.state = PeerState::Connected;
    peer.capabilities = reg_params.capabilities.clone();
    peer.advertised_tools = reg_params.tools.clone();
    if incoming {
        peer.transport_in = Some(transport_handle);
    } else {
        peer.transport_out = Some(transport_handle);
    }
    state.peers.upsert(peer);
    state.tools.register_additive(&node_id, &reg_params.tools);

    if link.outbound.send(response).await.is_err() {
        tracing::warn!(node_id, "failed to send node/accepted, connection already closed");
    }

    tracing::info!(node_id, incoming, "node registered");

    loop {
        match inbound.recv().await {
            Some(msg) => {
                if let Some(reply) = dispatch::dispatch(&state, &node_id, msg).await {
                    if link.outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            None => break,
        }
    }

    tracing::info!(node_id, "node disconnected");
    reconcile_disconnect(&state, &node_id, link.generation).await;
    joined.abort();
    Ok(())
}

/// On transport teardown: only clear the peer-table entry / tool-index
/// membership if no newer transport replaced it in the meantime (generation
/// check, spec §4.7's race-free reconnect cleanup) and fail any outstanding
/// calls targeting this node.
async fn reconcile_disconnect(state: &Arc<HubState>, node_id: &str, generation: u64) {
    // spec §4.7: "do not tear down the peer immediately if an alternative
    // transport exists... only when both transports are gone does the peer
    // transition to Disconnected." Clear only the half that belongs to this
    // generation; the peer (and its Tool Index membership) is removed only
    // once neither half is left.
    let fully_gone = state
        .peers
        .mutate(node_id, |p| {
            if p.transport_in.as_ref().map(|t| t.generation) == Some(generation) {
                p.transport_in = None;
            }
            if p.transport_out.as_ref().map(|t| t.generation) == Some(generation) {
                p.transport_out = None;
            }
            p.transport_in.is_none() && p.transport_out.is_none()
        })
        .unwrap_or(false);

    if fully_gone {
        state.peers.remove(node_id);
        state.tools.remove_peer(node_id);
        state.pending.fail_calls_to_target(node_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::TransportHandle;

    fn test_state() -> (tempfile::TempDir, Arc<HubState>) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(mesh_vault::Vault::open(dir.path().join("vault.json")).unwrap());
        let config = {
            use clap::Parser;
            crate::config::HubConfig::parse_from(["mesh-hub"])
        };
        (dir, Arc::new(HubState::new(config, "hub".into(), vault)))
    }

    fn handle(generation: u64) -> TransportHandle {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        TransportHandle {
            tx,
            generation,
            closer: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// spec §8 boundary: simultaneous inbound and outbound between the same
    /// two peers collapse into one Peer entry; the entry survives until
    /// *both* transports have closed (§4.7).
    #[tokio::test]
    async fn one_transport_closing_does_not_evict_the_peer() {
        let (_dir, state) = test_state();
        let mut peer = Peer::new("p1".into(), "p1.local".into());
        peer.state = PeerState::Connected;
        peer.transport_in = Some(handle(1));
        peer.transport_out = Some(handle(2));
        state.peers.upsert(peer);
        state.tools.register_additive("p1", &["echo".to_string()]);

        reconcile_disconnect(&state, "p1", 1).await;

        let remaining = state.peers.get("p1").expect("peer survives while transport_out is live");
        assert!(remaining.transport_in.is_none());
        assert!(remaining.transport_out.is_some());
        assert_eq!(state.tools.provider_count("echo"), 1);

        reconcile_disconnect(&state, "p1", 2).await;
        assert!(state.peers.get("p1").is_none());
        assert_eq!(state.tools.provider_count("echo"), 0);
    }
}
