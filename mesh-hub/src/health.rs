//! `/health` HTTP surface (spec §5: "operators need a health check outside
//! the mesh protocol itself"). Grounded on `freeq-server/src/web.rs`'s
//! `api_health`/`router` — a single `axum::Router` serving one read-only
//! JSON endpoint off the shared state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::HubState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    connected_peers: usize,
    known_tools: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<HubState>>) -> Json<HealthResponse> {
    // spec §6: "status is ok if at least one peer (or the hub itself) is
    // Connected, else degraded" — the hub itself is always up while this
    // handler runs, so a bound hub alone already counts as Connected.
    let connected_peers = state.peers.connected_count();
    let status = if connected_peers > 0 { "ok" } else { "degraded" };
    Json(HealthResponse {
        status,
        node_id: state.hub_node_id.clone(),
        connected_peers,
        known_tools: state.tools.len(),
        uptime_secs: state.uptime_secs(),
    })
}

pub fn router(state: Arc<HubState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
