//! Periodic gossip round: announce this node's directly-connected peers to
//! every neighbor, merge in whatever they send back (spec §4.6, ~30s), and
//! dial any newly-learned peer we are not already connected to.
//!
//! Grounded on `mesh-hub/src/heartbeat.rs`'s pattern of a dedicated
//! background task ticking on a fixed interval against shared state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::wire::methods;
use mesh_core::{GossipRecord, Message};

use crate::protocol::GossipParams;
use crate::state::PeerControllerState;

pub async fn run(endpoint: iroh::Endpoint, state: Arc<PeerControllerState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.gossip_interval_s));
    // Peers a `dial_forever` task has already been spawned for — each such
    // task retries on its own, so this only needs to prevent spawning a
    // second permanent dial loop for the same peer on a later tick.
    let mut dialing: HashSet<String> = HashSet::new();
    loop {
        ticker.tick().await;
        send_gossip(&state);
        dial_known_peers(&endpoint, &state, &mut dialing);
    }
}

fn send_gossip(state: &Arc<PeerControllerState>) {
    let now = mesh_core::envelope::now_unix();
    let mut records: Vec<GossipRecord> = state
        .peers
        .all_summaries()
        .into_iter()
        .map(|p| GossipRecord {
            peer_id: p.peer_id,
            address: String::new(),
            tools: p.tools,
            last_seen: now,
        })
        .collect();
    records.push(GossipRecord {
        peer_id: state.self_node_id.clone(),
        address: String::new(),
        tools: state.tools.tool_names(),
        last_seen: now,
    });

    let payload = serde_json::to_value(GossipParams { peers: records }).expect("GossipParams serializes");
    for peer_id in state.peers.ids() {
        let Some(peer) = state.peers.get(&peer_id) else { continue };
        let Some(transport) = peer.usable_transport() else { continue };
        let notification = Message::notification(methods::PEER_GOSSIP, payload.clone());
        let _ = transport.tx.try_send(notification);
    }
}

/// Dial any peer we have heard of but are not directly connected to and
/// have not already started a permanent dial loop for.
fn dial_known_peers(endpoint: &iroh::Endpoint, state: &Arc<PeerControllerState>, dialing: &mut HashSet<String>) {
    let connected = state.peers.ids();
    for record in state.known.not_in(&connected) {
        if record.peer_id == state.self_node_id || dialing.contains(&record.peer_id) {
            continue;
        }
        dialing.insert(record.peer_id.clone());
        let endpoint = endpoint.clone();
        let state = Arc::clone(state);
        let peer_id = record.peer_id;
        tokio::spawn(async move {
            crate::dial::dial_forever(endpoint, state, peer_id).await;
        });
    }
}
