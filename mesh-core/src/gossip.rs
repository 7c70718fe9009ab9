//! Gossip records and the "known peers" table (spec §3 `GossipRecord`,
//! §4.6). Idempotent merge: duplicate records are discarded, `last_seen`
//! is taken as the maximum (spec §8 "Idempotence" property).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRecord {
    pub peer_id: PeerId,
    pub address: String,
    pub tools: Vec<String>,
    /// Unix seconds.
    pub last_seen: i64,
}

/// Peers we have heard of via gossip but are not (yet, or currently)
/// connected to directly.
#[derive(Default)]
pub struct KnownPeers {
    inner: RwLock<HashMap<PeerId, GossipRecord>>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record. Returns `true` if this changed the known-peers
    /// state (new peer, or a strictly newer `last_seen`/different address).
    pub fn merge(&self, record: GossipRecord) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(&record.peer_id) {
            Some(existing) => {
                if record.last_seen > existing.last_seen {
                    existing.last_seen = record.last_seen;
                    existing.address = record.address;
                    existing.tools = record.tools;
                    true
                } else {
                    false
                }
            }
            None => {
                inner.insert(record.peer_id.clone(), record);
                true
            }
        }
    }

    pub fn merge_all(&self, records: impl IntoIterator<Item = GossipRecord>) -> usize {
        records.into_iter().filter(|r| self.merge(r.clone())).count()
    }

    pub fn get(&self, peer_id: &str) -> Option<GossipRecord> {
        self.inner.read().get(peer_id).cloned()
    }

    pub fn all(&self) -> Vec<GossipRecord> {
        self.inner.read().values().cloned().collect()
    }

    pub fn remove(&self, peer_id: &str) {
        self.inner.write().remove(peer_id);
    }

    /// Known peers not currently present (as a live connection) in
    /// `connected`, for the Peer Controller's dial-out-to-known-peers step
    /// (spec §4.6).
    pub fn not_in(&self, connected: &[PeerId]) -> Vec<GossipRecord> {
        self.inner
            .read()
            .values()
            .filter(|r| !connected.iter().any(|id| id == &r.peer_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer_id: &str, last_seen: i64) -> GossipRecord {
        GossipRecord {
            peer_id: peer_id.to_string(),
            address: "127.0.0.1:9000".to_string(),
            tools: vec!["echo".to_string()],
            last_seen,
        }
    }

    #[test]
    fn duplicate_gossip_record_is_idempotent() {
        let known = KnownPeers::new();
        assert!(known.merge(record("p1", 100)));
        assert!(!known.merge(record("p1", 100)));
        assert_eq!(known.all().len(), 1);
    }

    #[test]
    fn newer_last_seen_wins() {
        let known = KnownPeers::new();
        known.merge(record("p1", 100));
        assert!(known.merge(record("p1", 200)));
        assert_eq!(known.get("p1").unwrap().last_seen, 200);

        // Stale (older) record is discarded, not applied.
        assert!(!known.merge(record("p1", 150)));
        assert_eq!(known.get("p1").unwrap().last_seen, 200);
    }

    #[test]
    fn applying_same_record_twice_yields_identical_state() {
        let known_a = KnownPeers::new();
        let known_b = KnownPeers::new();
        for _ in 0..2 {
            known_a.merge(record("p1", 100));
        }
        known_b.merge(record("p1", 100));
        assert_eq!(known_a.all().len(), known_b.all().len());
        assert_eq!(known_a.get("p1").unwrap().last_seen, known_b.get("p1").unwrap().last_seen);
    }
}
