//! Periodic heartbeat sweep: demotes/offlines peers that stop pinging and
//! reconciles the Tool Index so Offline peers are never selected as
//! providers (spec §4.5/I1). Grounded on `freeq-server/src/s2s.rs`'s pattern
//! of a dedicated background task ticking on a fixed interval against
//! shared state.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::PeerState;

use crate::state::HubState;

pub async fn run(state: Arc<HubState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.heartbeat_sweep_s));
    loop {
        ticker.tick().await;
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
