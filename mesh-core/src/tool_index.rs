//! Tool Index: tool name → ordered provider list, with load-balanced
//! selection (spec §4.3).
//!
//! Insertion order is registration order; selection is least-in-flight
//! first among selectable peers, ties broken by registration order. Per
//! the Open Question resolved in SPEC_FULL.md §9, Degraded peers are
//! down-weighted (sorted after Connected) rather than excluded; only
//! Offline/Disconnected/Connecting peers are excluded outright — this is
//! the literal "excluded at Offline only" rule from spec §8 scenario 5.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::peer::{PeerId, PeerState, PeerTable};

#[derive(Default)]
pub struct ToolIndex {
    inner: RwLock<HashMap<String, Vec<PeerId>>>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additive registration (spec §9: "additive on initial registration").
    /// Appends `peer_id` to each tool's provider list if not already present.
    pub fn register_additive(&self, peer_id: &str, tools: &[String]) {
        let mut inner = self.inner.write();
        for tool in tools {
            let providers = inner.entry(tool.clone()).or_default();
            if !providers.iter().any(|p| p == peer_id) {
                providers.push(peer_id.to_string());
            }
        }
    }

    /// Full replacement (spec §9: "full replacement on tools/list"). Removes
    /// `peer_id` from every tool it no longer advertises and appends it
    /// (at the end, i.e. as if freshly registered) to every tool in the new
    /// list it wasn't already providing.
    pub fn replace(&self, peer_id: &str, tools: &[String]) {
        let mut inner = self.inner.write();
        for (tool, providers) in inner.iter_mut() {
            if !tools.iter().any(|t| t == tool) {
                providers.retain(|p| p != peer_id);
            }
        }
        for tool in tools {
            let providers = inner.entry(tool.clone()).or_default();
            if !providers.iter().any(|p| p == peer_id) {
                providers.push(peer_id.to_string());
            }
        }
    }

    /// Remove a peer from every tool's provider list (on disconnect /
    /// unregister).
    pub fn remove_peer(&self, peer_id: &str) {
        let mut inner = self.inner.write();
        for providers in inner.values_mut() {
            providers.retain(|p| p != peer_id);
        }
        inner.retain(|_, providers| !providers.is_empty());
    }

    pub fn providers_of(&self, tool: &str) -> Vec<PeerId> {
        self.inner.read().get(tool).cloned().unwrap_or_default()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn provider_count(&self, tool: &str) -> usize {
        self.inner.read().get(tool).map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Select a provider for `tool` among peers the `PeerTable` considers
    /// selectable (Connected or Degraded, not Offline/Disconnected/
    /// Connecting). Least-in-flight-first, ties broken by registration
    /// order (the order `providers_of` returns them in).
    pub fn select(&self, tool: &str, peers: &PeerTable) -> Option<PeerId> {
        let providers = self.providers_of(tool);
        let mut best: Option<(PeerId, u64, u8)> = None; // (id, request_count, state_rank)
        for peer_id in providers {
            let Some(peer) = peers.get(&peer_id) else { continue };
            let state_rank = match peer.state {
                PeerState::Connected => 0u8,
                PeerState::Degraded => 1,
                _ => continue, // Offline/Disconnected/Connecting: never selected (I1)
            };
            if !peer.has_live_transport() {
                continue;
            }
            let candidate = (peer_id.clone(), peer.request_count, state_rank);
            best = match best {
                None => Some(candidate),
                Some(ref cur) => {
                    // Lower state_rank (Connected) wins; then lower request_count;
                    // registration order (first seen) is preserved by `continue`-ing
                    // on strict non-improvement.
                    if candidate.2 < cur.2
                        || (candidate.2 == cur.2 && candidate.1 < cur.1)
                    {
                        Some(candidate)
                    } else {
                        best
                    }
                }
            };
        }
        best.map(|(id, _, _)| id)
    }
}
