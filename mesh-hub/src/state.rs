//! Shared Hub state: the composition root for Peer Table, Tool Index,
//! Pending-Call Table, and the Federation Vault (spec §2 item 7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mesh_core::{KnownPeers, PeerTable, PendingCallTable, ToolIndex};
use mesh_vault::Vault;

use crate::config::HubConfig;

pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a connection handler or timer needs, held behind one `Arc`
/// (teacher's `SharedState` pattern in `freeq-server/src/server.rs`).
pub struct HubState {
    pub config: HubConfig,
    pub hub_node_id: String,
    pub peers: PeerTable,
    pub tools: ToolIndex,
    pub pending: PendingCallTable,
    /// Peers the hub has heard about transitively via a federated
    /// `mesh-peer`'s gossip but is not itself connected to — used only to
    /// answer `mesh/nodes` more completely; the hub never dials out to them
    /// (that is `mesh-peer`'s job, §4.6).
    pub known: KnownPeers,
    pub vault: Arc<Vault>,
    pub started_at: Instant,
    conn_gen: AtomicU64,
    session_counter: AtomicU64,
    pub calls_routed: AtomicU64,
    pub calls_failed: AtomicU64,
    pub broadcasts_sent: AtomicU64,
}

impl HubState {
    pub fn new(config: HubConfig, hub_node_id: String, vault: Arc<Vault>) -> Self {
        HubState {
            config,
            hub_node_id,
            peers: PeerTable::new(),
            tools: ToolIndex::new(),
            pending: PendingCallTable::new(),
            known: KnownPeers::new(),
            vault,
            started_at: Instant::now(),
            conn_gen: AtomicU64::new(0),
            session_counter: AtomicU64::new(0),
            calls_routed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.conn_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_session_id(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed);
        format!("sess-{n:x}")
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
