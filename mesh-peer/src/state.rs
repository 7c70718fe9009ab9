//! Shared Peer state: the composition root for this node's Peer Table,
//! Tool Index, Pending-Call Table, Known Peers, Vault, and tool executor
//! (spec §2 item 8). Mirrors `mesh-hub`'s `HubState`, generalized with the
//! dial-out/gossip bookkeeping the Hub doesn't need.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mesh_core::{KnownPeers, PeerTable, PendingCallTable, ToolExecutor, ToolIndex};
use mesh_vault::Vault;

use crate::config::PeerConfig;

pub const PEER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Composition root for a Peer Controller (spec §2 item 8). Named
/// `PeerControllerState` rather than `PeerState` to keep it distinct from
/// `mesh_core::PeerState`, the per-connection state-machine enum.
pub struct PeerControllerState {
    pub config: PeerConfig,
    /// This node's own iroh-endpoint-derived identity (may differ from
    /// `config.node_id` only in that the latter is the Vault-registered
    /// claim being proven; in steady state they refer to the same node).
    pub self_node_id: String,
    pub peers: PeerTable,
    pub tools: ToolIndex,
    pub pending: PendingCallTable,
    pub known: KnownPeers,
    pub vault: Arc<Vault>,
    pub executor: Arc<dyn ToolExecutor>,
    pub started_at: Instant,
    conn_gen: AtomicU64,
    pub calls_routed: AtomicU64,
    pub calls_failed: AtomicU64,
    pub broadcasts_sent: AtomicU64,
    pub routes_forwarded: AtomicU64,
}

impl PeerControllerState {
    pub fn new(config: PeerConfig, self_node_id: String, vault: Arc<Vault>, executor: Arc<dyn ToolExecutor>) -> Self {
        PeerControllerState {
            config,
            self_node_id,
            peers: PeerTable::new(),
            tools: ToolIndex::new(),
            pending: PendingCallTable::new(),
            known: KnownPeers::new(),
            vault,
            executor,
            started_at: Instant::now(),
            conn_gen: AtomicU64::new(0),
            calls_routed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            routes_forwarded: AtomicU64::new(0),
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.conn_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
