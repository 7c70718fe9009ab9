//! Passive heartbeat sweep (spec §4.5/§4.7): demotes/offlines peers whose
//! `ping`s (sent by `health.rs`'s active loop, or received from the far
//! side) have gone quiet, and reconciles the Tool Index so an Offline peer
//! is never selected (I1). Identical in shape to `mesh-hub/src/heartbeat.rs`.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::PeerState;

use crate::state::PeerControllerState;

pub async fn run(state: Arc<PeerControllerState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.heartbeat_sweep_s));
    loop {
        ticker.tick().await;
        // The self-loop entry (if any) never receives a network ping; treat
        // it as always fresh so the sweep never demotes our own tools.
        state.peers.record_ping(&state.self_node_id);

        let thresholds = state.config.heartbeat_thresholds();
        let changed = state.peers.sweep_heartbeats(thresholds);
        for (peer_id, before, after) in changed {
            tracing::info!(peer_id, ?before, ?after, "peer state transition");
            if after == PeerState::Offline {
                state.tools.remove_peer(&peer_id);
                state.pending.fail_calls_to_target(&peer_id).await;
            }
        }
    }
}
