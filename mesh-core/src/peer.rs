//! Peer Table: the connected-peer registry shared by Hub and Peer
//! controllers (spec §3 `Peer`, §4.5 state machine, §4.7 failure semantics).
//!
//! Grounded on `freeq-server/src/s2s.rs`'s `S2sManager.peers` /
//! `PeerEntry { tx, conn_gen }`: a peer can have up to two live transport
//! handles (one inbound, one outbound between the same pair), writes pick
//! the first live one, and a generation counter makes reconnect-cleanup
//! race-free (SPEC_FULL.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::wire::Message;

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connecting,
    Connected,
    Degraded,
    Offline,
    /// A Peer Controller's health-check ping failed (spec §4.6 "Health").
    /// Distinct from `Offline` (heartbeat silence on the hub side): `Failed`
    /// means an active probe got a negative answer, not just silence.
    Failed,
    Disconnected,
}

/// One live transport handle: a channel into that transport's write loop,
/// tagged with a generation so stale cleanup never removes a replacement's
/// entry (I6: reconnect preserves peer_id, creates a fresh transport, the
/// stale transport is force-closed before the new one replaces it). `closer`
/// lets a re-registration actively terminate this transport's connection
/// task rather than just abandoning its peer-table entry (spec I6 mandates
/// force-close, not mere bookkeeping replacement).
#[derive(Clone)]
pub struct TransportHandle {
    pub tx: mpsc::Sender<Message>,
    pub generation: u64,
    pub closer: Arc<Notify>,
}

impl TransportHandle {
    pub fn is_usable(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Signal the owning connection task to tear itself down. Idempotent —
    /// safe to call even if the task has already exited.
    pub fn force_close(&self) {
        self.closer.notify_waiters();
    }
}

#[derive(Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub address: Option<String>,
    pub hostname: String,
    pub state: PeerState,
    /// Inbound transport (we accepted their dial), if live.
    pub transport_in: Option<TransportHandle>,
    /// Outbound transport (we dialed them), if live.
    pub transport_out: Option<TransportHandle>,
    pub advertised_tools: Vec<String>,
    pub capabilities: Vec<String>,
    pub connected_at: Instant,
    pub last_ping_at: Instant,
    pub request_count: u64,
}

impl Peer {
    pub fn new(peer_id: PeerId, hostname: String) -> Self {
        let now = Instant::now();
        Peer {
            peer_id,
            address: None,
            hostname,
            state: PeerState::Connecting,
            transport_in: None,
            transport_out: None,
            advertised_tools: Vec::new(),
            capabilities: Vec::new(),
            connected_at: now,
            last_ping_at: now,
            request_count: 0,
        }
    }

    /// First usable transport, preferring inbound (arbitrary but stable
    /// tie-break — matches teacher's "writes pick the first live handle").
    pub fn usable_transport(&self) -> Option<&TransportHandle> {
        self.transport_in
            .as_ref()
            .filter(|t| t.is_usable())
            .or_else(|| self.transport_out.as_ref().filter(|t| t.is_usable()))
    }

    pub fn has_live_transport(&self) -> bool {
        self.usable_transport().is_some()
    }

    pub fn to_summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            hostname: self.hostname.clone(),
            state: self.state,
            tools: self.advertised_tools.clone(),
            capabilities: self.capabilities.clone(),
            request_count: self.request_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub hostname: String,
    pub state: PeerState,
    pub tools: Vec<String>,
    pub capabilities: Vec<String>,
    pub request_count: u64,
}

/// Heartbeat thresholds (spec §4.5 state machine; defaults from §6).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatThresholds {
    pub degraded_after: Duration,
    pub offline_after: Duration,
}

impl Default for HeartbeatThresholds {
    fn default() -> Self {
        HeartbeatThresholds {
            degraded_after: Duration::from_secs(60),
            offline_after: Duration::from_secs(90),
        }
    }
}

/// The shared Peer Table. One `RwLock` guards both peer entries and (via
/// `ToolIndex`, held separately but updated under the same write section by
/// callers) the tool index, per SPEC_FULL.md §5's "Peer Table and Tool
/// Index share one reader-writer lock".
pub struct PeerTable {
    inner: RwLock<HashMap<PeerId, Peer>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a peer entry, returning the previous entry (if
    /// any) so the caller can force-close its transports (I6).
    pub fn upsert(&self, peer: Peer) -> Option<Peer> {
        self.inner.write().insert(peer.peer_id.clone(), peer)
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.inner.read().get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &str) -> Option<Peer> {
        self.inner.write().remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.inner.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    pub fn all_summaries(&self) -> Vec<PeerSummary> {
        self.inner.read().values().map(Peer::to_summary).collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Apply `f` to a peer under the write lock; returns `None` if absent.
    pub fn mutate<R>(&self, peer_id: &str, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.inner.write().get_mut(peer_id).map(f)
    }

    /// Sweep for heartbeat demotion/promotion (spec §4.5's failure detector
    /// tick). Returns the list of peers whose state changed, for the
    /// caller to reconcile the Tool Index (I1) and log.
    pub fn sweep_heartbeats(&self, thresholds: HeartbeatThresholds) -> Vec<(PeerId, PeerState, PeerState)> {
        let now = Instant::now();
        let mut changed = Vec::new();
        let mut inner = self.inner.write();
        for peer in inner.values_mut() {
            let since_ping = now.duration_since(peer.last_ping_at);
            let before = peer.state;
            let after = match peer.state {
                PeerState::Connected | PeerState::Degraded => {
                    if since_ping >= thresholds.offline_after {
                        PeerState::Offline
                    } else if since_ping >= thresholds.degraded_after {
                        PeerState::Degraded
                    } else {
                        PeerState::Connected
                    }
                }
                other => other,
            };
            if after != before {
                peer.state = after;
                changed.push((peer.peer_id.clone(), before, after));
            }
        }
        changed
    }

    /// Record a heartbeat/ping, promoting Degraded/Offline back to
    /// Connected (spec §4.5: "Recovery on next heartbeat promotes back to
    /// Connected").
    pub fn record_ping(&self, peer_id: &str) -> bool {
        self.mutate(peer_id, |p| {
            p.last_ping_at = Instant::now();
            if p.state == PeerState::Degraded || p.state == PeerState::Offline {
                p.state = PeerState::Connected;
            }
        })
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_sweep_demotes_then_offlines() {
        let table = PeerTable::new();
        let mut peer = Peer::new("p1".into(), "host".into());
        peer.state = PeerState::Connected;
        peer.last_ping_at = Instant::now() - Duration::from_secs(61);
        table.upsert(peer);

        let thresholds = HeartbeatThresholds {
            degraded_after: Duration::from_secs(60),
            offline_after: Duration::from_secs(90),
        };
        let changed = table.sweep_heartbeats(thresholds);
        assert_eq!(changed, vec![("p1".to_string(), PeerState::Connected, PeerState::Degraded)]);
        assert_eq!(table.get("p1").unwrap().state, PeerState::Degraded);
    }

    #[test]
    fn ping_promotes_degraded_back_to_connected() {
        let table = PeerTable::new();
        let mut peer = Peer::new("p1".into(), "host".into());
        peer.state = PeerState::Degraded;
        table.upsert(peer);
        assert!(table.record_ping("p1"));
        assert_eq!(table.get("p1").unwrap().state, PeerState::Connected);
    }

    #[test]
    fn upsert_returns_previous_entry_for_forced_close() {
        let table = PeerTable::new();
        let first = Peer::new("p1".into(), "host-a".into());
        assert!(table.upsert(first).is_none());
        let second = Peer::new("p1".into(), "host-b".into());
        let prev = table.upsert(second).expect("previous entry returned");
        assert_eq!(prev.hostname, "host-a");
        assert_eq!(table.get("p1").unwrap().hostname, "host-b");
    }
}
