//! Outbound dial-out to bootstrap peers and gossip-discovered peers (spec
//! §4.6: "on startup, a Peer Controller dials configured bootstrap peers
//! and/or a hub"), with reconnect-on-drop backoff.
//!
//! Grounded on `freeq-server/src/s2s.rs`'s `connect_peer_with_retry`: skip
//! the attempt if an incoming link already won the race, otherwise connect,
//! run the link to completion, then back off and retry.

use std::sync::Arc;

use mesh_core::transport::{Backoff, SignConfig};
use mesh_core::wire::methods;
use mesh_core::Message;

use crate::connection::{install_transport, run_loop};
use crate::protocol::{HandshakeParams, HandshakeResult};
use crate::state::PeerControllerState as PeerState;

/// Dial one peer forever, reconnecting with backoff whenever the link
/// drops. Spawned once per configured bootstrap peer at startup and once
/// per newly-learned gossip peer.
pub async fn dial_forever(endpoint: iroh::Endpoint, state: Arc<PeerState>, target: String) {
    let mut backoff = Backoff::default();
    loop {
        if state.peers.get(&target).map(|p| p.has_live_transport()).unwrap_or(false) {
            tracing::debug!(peer = %target, "already connected, skipping outbound dial");
            tokio::time::sleep(backoff.next()).await;
            continue;
        }

        match dial_once(&endpoint, &state, &target).await {
            Ok(()) => {
                backoff.reset();
                tracing::warn!(peer = %target, "peer link dropped, will reconnect");
            }
            Err(e) => {
                tracing::warn!(peer = %target, error = %e, "dial failed");
            }
        }

        tokio::time::sleep(backoff.next()).await;
    }
}

/// One dial attempt: connect, perform `peer/handshake`, then run the
/// shared dispatch loop until the link drops.
async fn dial_once(endpoint: &iroh::Endpoint, state: &Arc<PeerState>, target: &str) -> anyhow::Result<()> {
    let endpoint_id: iroh::EndpointId = target
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid peer endpoint id {target}: {e}"))?;
    let addr = iroh::EndpointAddr::new(endpoint_id);

    let secret = state
        .config
        .shared_secret
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no shared secret configured, cannot dial peer/1 links"))?;
    let sign = SignConfig {
        secret: Arc::from(secret.as_str()),
        window_s: state.config.signed_envelope_window_s,
    };

    tracing::info!(peer = %target, "dialing peer");
    let conn = endpoint.connect(addr, mesh_core::identity::MESH_PEER_ALPN).await?;

    let generation = state.next_generation();
    let (link, mut inbound, joined) = mesh_core::transport::spawn(conn, false, generation, 256, Some(sign)).await?;

    let handshake = Message::request(
        1,
        methods::PEER_HANDSHAKE,
        serde_json::to_value(HandshakeParams {
            node_id: state.self_node_id.clone(),
            token: state.config.token.clone(),
            tools: state.tools.tool_names(),
            address: None,
        })
        .expect("HandshakeParams serializes"),
    );
    link.outbound.send(handshake).await.map_err(|_| anyhow::anyhow!("handshake send failed"))?;

    let reply = inbound.recv().await.ok_or_else(|| anyhow::anyhow!("connection closed before handshake reply"))?;
    if let Some(err) = reply.error {
        joined.abort();
        anyhow::bail!("peer rejected handshake: {}", err.message);
    }
    let remote: HandshakeResult = reply
        .result
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| anyhow::anyhow!("malformed peer/handshake reply"))?;

    // `install_transport` only mutates an existing Peer Table entry — on a
    // fresh outbound dial there is none yet (the incoming-accept path
    // creates one from `node/register`/`peer/handshake` params, but nothing
    // does so for the side that *initiated* the dial). Without this, the
    // link would run but the remote would stay invisible to routing, the
    // Tool Index, and gossip from this node's point of view.
    if state.peers.get(target).is_none() {
        let mut peer = mesh_core::Peer::new(target.to_string(), remote.node_id.clone());
        peer.state = mesh_core::PeerState::Connected;
        peer.advertised_tools = remote.tools.clone();
        state.peers.upsert(peer);
    } else {
        state.peers.mutate(target, |p| {
            p.state = mesh_core::PeerState::Connected;
            p.advertised_tools = remote.tools.clone();
        });
    }
    state.tools.register_additive(target, &remote.tools);

    install_transport(state, target, false, &link);
    tracing::info!(peer = %target, "peer handshake complete");

    run_loop(Arc::clone(state), target.to_string(), link, inbound).await;
    joined.abort();
    Ok(())
}
