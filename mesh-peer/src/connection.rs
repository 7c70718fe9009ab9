//! Per-connection accept handling: ALPN routing, the register gate, and the
//! read/dispatch loop once a link is live.
//!
//! A full peer node additionally accepts direct connections (spec §1), so
//! its first message may be either `node/register` (a tool-provider
//! registering directly) or `peer/handshake` (another node federating).
//! Both paths share one tie-break/installation routine; only the bearer
//! check and the resulting `AcceptedResult`/`HandshakeResult` differ.
//!
//! Grounded on `mesh-hub/src/connection.rs`, itself grounded on
//! `freeq-server/src/iroh.rs`'s ALPN-routed accept loop and
//! `freeq-server/src/s2s.rs`'s `handle_s2s_connection`.

use std::sync::Arc;

use iroh::endpoint::Connection;
use mesh_core::identity::{MESH_ALPN, MESH_PEER_ALPN};
use mesh_core::transport::{Link, SignConfig};
use mesh_core::wire::methods;
use mesh_core::{MeshError, Message, Peer, PeerState, TransportHandle};
use mesh_vault::VerifyOutcome;
use serde_json::Value;

use crate::dispatch;
use crate::protocol::{AcceptedResult, HandshakeParams, HandshakeResult, RegisterParams};
use crate::state::PeerControllerState as PState;

/// Accept one incoming connection, routing by ALPN exactly as the Hub does
/// (spec §4.1): plain for tool-provider/client links, signed-envelope for
/// federated `peer/1` links.
pub async fn handle_incoming(conn: Connection, state: Arc<PState>) {
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

    if let Err(e) = accept_session(conn, state, sign).await {
        tracing::debug!(error = %e, "connection ended");
    }
}

/// Wait for the first message and route it to whichever gate applies, then
/// hand off to the shared dispatch loop.
async fn accept_session(conn: Connection, state: Arc<PState>, sign: Option<SignConfig>) -> anyhow::Result<()> {
    let remote_ip: Option<String> = None; // see DESIGN.md: iroh authenticates by node id, not source IP
    let generation = state.next_generation();
    let (link, mut inbound, joined) = mesh_core::transport::spawn(conn, true, generation, 256, sign).await?;

    let first = match inbound.recv().await {
        Some(msg) => msg,
        None => {
            joined.abort();
            return Ok(());
        }
    };

    let req_id = first.id.clone().unwrap_or(Value::Null);
    let params = first.params.clone().unwrap_or(Value::Null);

    let outcome = match first.method.as_deref() {
        Some(methods::NODE_REGISTER) => register_as_node(&state, req_id.clone(), params, remote_ip.as_deref()),
        Some(methods::PEER_HANDSHAKE) => register_as_peer(&state, req_id.clone(), params, remote_ip.as_deref()),
        _ => Err(MeshError::NotRegistered),
    };

    let (node_id, response) = match outcome {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "incoming link rejected before registration");
            let err = Message::error_response(Some(req_id), e.into());
            let _ = link.outbound.send(err).await;
            joined.abort();
            return Ok(());
        }
    };

    install_transport(&state, &node_id, true, &link);

    if link.outbound.send(response).await.is_err() {
        tracing::warn!(node_id, "failed to send registration response, connection already closed");
    }

    tracing::info!(node_id, "incoming node registered");
    run_loop(state, node_id, link, inbound).await;
    joined.abort();
    Ok(())
}

/// Validate `node/register` against the Federation Vault and build the
/// response; does not touch the Peer Table (the caller owns installing the
/// transport once it knows which direction it is — in vs. out — applies).
fn register_as_node(
    state: &PState,
    req_id: Value,
    params: Value,
    client_ip: Option<&str>,
) -> Result<(String, Message), MeshError> {
    let params: RegisterParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    verify_bearer(state, &params.node_id, &params.token, client_ip)?;

    // A concurrent outbound dial to this same node id may already have
    // created the Peer Table entry and installed `transport_out` (spec §8:
    // "simultaneous inbound and outbound... exactly one merged Peer entry").
    // A blind `upsert` here would replace the whole entry and drop that
    // transport; mutate in place when the entry already exists.
    if state.peers.get(&params.node_id).is_none() {
        let mut peer = Peer::new(params.node_id.clone(), params.hostname.clone());
        peer.state = PeerState::Connected;
        peer.capabilities = params.capabilities.clone();
        peer.advertised_tools = params.tools.clone();
        state.peers.upsert(peer);
    } else {
        state.peers.mutate(&params.node_id, |p| {
            p.hostname = params.hostname.clone();
            p.state = PeerState::Connected;
            p.capabilities = params.capabilities.clone();
            p.advertised_tools = params.tools.clone();
        });
    }
    state.tools.register_additive(&params.node_id, &params.tools);

    let accepted = AcceptedResult {
        session_id: format!("sess-{:x}", state.next_generation()),
        node_id: params.node_id.clone(),
        peer_version: crate::state::PEER_VERSION.to_string(),
        connected_count: state.peers.connected_count(),
        known_tool_count: state.tools.len(),
    };
    let response = Message::response(req_id, serde_json::to_value(accepted).expect("AcceptedResult serializes"));
    Ok((params.node_id, response))
}

/// Validate `peer/handshake`'s bearer token and build the symmetric
/// identity/tool exchange response (spec §4.6).
fn register_as_peer(
    state: &PState,
    req_id: Value,
    params: Value,
    client_ip: Option<&str>,
) -> Result<(String, Message), MeshError> {
    let params: HandshakeParams =
        serde_json::from_value(params).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
    verify_bearer(state, &params.node_id, &params.token, client_ip)?;

    // Same merge concern as `register_as_node`: dial and accept key by the
    // same node id, so an in-flight outbound dial's `transport_out` must
    // survive this inbound accept rather than being wiped by a fresh `Peer`.
    if state.peers.get(&params.node_id).is_none() {
        let mut peer = Peer::new(params.node_id.clone(), params.node_id.clone());
        peer.address = params.address.clone();
        peer.state = PeerState::Connected;
        peer.advertised_tools = params.tools.clone();
        state.peers.upsert(peer);
    } else {
        state.peers.mutate(&params.node_id, |p| {
            p.address = params.address.clone();
            p.state = PeerState::Connected;
            p.advertised_tools = params.tools.clone();
        });
    }
    state.tools.register_additive(&params.node_id, &params.tools);

    let response = Message::response(
        req_id,
        serde_json::to_value(HandshakeResult {
            node_id: state.self_node_id.clone(),
            tools: state.tools.tool_names(),
        })
        .expect("HandshakeResult serializes"),
    );
    Ok((params.node_id, response))
}

fn verify_bearer(state: &PState, node_id: &str, token: &str, client_ip: Option<&str>) -> Result<(), MeshError> {
    match state.vault.verify(node_id, token, client_ip) {
        VerifyOutcome::Valid => Ok(()),
        VerifyOutcome::UnknownNode => Err(MeshError::UnknownNode(node_id.to_string())),
        VerifyOutcome::Revoked => Err(MeshError::Revoked(node_id.to_string())),
        VerifyOutcome::IpNotAllowed => Err(MeshError::IpNotAllowed(node_id.to_string())),
        VerifyOutcome::BadToken => Err(MeshError::UnknownNode(node_id.to_string())),
    }
}

/// Install this link's transport in the Peer Table, force-closing any
/// stale transport for the same node id first (I6: race-free reconnect
/// cleanup via the generation counter).
pub fn install_transport(state: &PState, node_id: &str, incoming: bool, link: &Link) {
    let transport_handle = TransportHandle {
        tx: link.outbound.clone(),
        generation: link.generation,
        closer: Arc::clone(&link.closer),
    };
    // Only force-close a stale transport of the *same* direction we're about
    // to replace (I6 reconnect race). The other direction's transport, if
    // any, is a legitimate independent link (spec §8's dual-transport
    // scenario) and must be left alone.
    if let Some(prev) = state.peers.get(node_id) {
        let stale = if incoming { prev.transport_in.as_ref() } else { prev.transport_out.as_ref() };
        if let Some(t) = stale.filter(|t| t.generation != transport_handle.generation) {
            t.force_close();
        }
    }
    state.peers.mutate(node_id, |p| {
        if incoming {
            p.transport_in = Some(transport_handle.clone());
        } else {
            p.transport_out = Some(transport_handle.clone());
        }
    });
}

/// Shared read/dispatch loop, used by both the inbound accept gate and
/// `dial.rs`'s outbound handshake once a link is live.
pub async fn run_loop(state: Arc<PState>, node_id: String, link: Link, mut inbound: tokio::sync::mpsc::Receiver<Message>) {
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
}

/// On transport teardown: only clear the peer-table entry / tool-index
/// membership if no newer transport replaced it in the meantime (generation
/// check, I6) and fail any outstanding calls targeting this node.
async fn reconcile_disconnect(state: &Arc<PState>, node_id: &str, generation: u64) {
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
    use mesh_core::NullExecutor;

    fn test_state() -> (tempfile::TempDir, Arc<PState>) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(mesh_vault::Vault::open(dir.path().join("vault.json")).unwrap());
        let config = {
            use clap::Parser;
            crate::config::PeerConfig::parse_from(["mesh-peer", "--node-id", "self", "--token", "t"])
        };
        (dir, Arc::new(PState::new(config, "self".into(), vault, Arc::new(NullExecutor))))
    }

    fn handle(generation: u64) -> TransportHandle {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        TransportHandle {
            tx,
            generation,
            closer: Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn test_link(generation: u64) -> mesh_core::transport::Link {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        mesh_core::transport::Link {
            outbound: tx,
            generation,
            closer: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// spec §8: installing a fresh transport in one direction must not
    /// force-close a live transport already installed in the *other*
    /// direction — that would make the dual-transport scenario impossible to
    /// reach, since the second leg would tear down the first the instant it
    /// registered.
    #[tokio::test]
    async fn installing_inbound_leaves_live_outbound_alone() {
        let (_dir, state) = test_state();
        let mut peer = Peer::new("p1".into(), "p1.local".into());
        peer.state = PeerState::Connected;
        let out_handle = handle(2);
        peer.transport_out = Some(out_handle.clone());
        state.peers.upsert(peer);

        // A task parked on the outbound transport's closer: if
        // `install_transport` force-closes it, `notify_waiters` wakes this
        // task immediately.
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let closer = Arc::clone(&out_handle.closer);
        let flag = Arc::clone(&closed);
        tokio::spawn(async move {
            closer.notified().await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        let link = test_link(3);
        install_transport(&state, "p1", true, &link);
        tokio::task::yield_now().await;

        let updated = state.peers.get("p1").unwrap();
        assert!(updated.transport_in.is_some());
        assert!(updated.transport_out.is_some(), "live outbound transport must survive");
        assert!(!closed.load(std::sync::atomic::Ordering::SeqCst), "outbound transport must not be force-closed");
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

    /// spec §8: an outbound dial that wins the race and installs
    /// `transport_out` before the matching inbound `peer/handshake` arrives
    /// must not have that transport wiped out when the inbound side
    /// registers — the two legs merge into one Peer entry.
    #[tokio::test]
    async fn register_as_peer_merges_into_existing_outbound_transport() {
        let (_dir, state) = test_state();
        let mut peer = Peer::new("p1".into(), "p1.local".into());
        peer.state = PeerState::Connected;
        peer.transport_out = Some(handle(1));
        state.peers.upsert(peer);
        let token = state.vault.register("p1", mesh_vault::Role::Node, vec![]).unwrap();

        let params: HandshakeParams = serde_json::from_value(serde_json::json!({
            "node_id": "p1",
            "token": token,
            "tools": ["echo"],
            "address": null,
        }))
        .unwrap();
        let (_node_id, _response) = register_as_peer(
            &state,
            serde_json::json!(1),
            serde_json::to_value(params).unwrap(),
            None,
        )
        .expect("valid bearer token is accepted");

        let merged = state.peers.get("p1").expect("peer entry must survive registration");
        assert!(merged.transport_out.is_some(), "pre-existing outbound transport must not be wiped");
        assert_eq!(merged.advertised_tools, vec!["echo".to_string()]);
    }
}
