//! Pending-Call Table: correlates outbound request ids to one-shot waiters
//! (spec §4.4). Grounded on `freeq-server/src/server.rs`'s
//! `OAuthPending { cancel: oneshot::Sender<()> }` — the teacher already
//! uses a `tokio::sync::oneshot` one-shot-rendezvous for exactly this shape
//! of "exactly one terminal resolution" (spec invariant I2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::MeshError;
use crate::peer::PeerId;

pub type RequestId = u64;

/// Default call deadline (spec §6 `call_default_timeout_s`).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Result(Value),
    Error(MeshError),
}

struct Entry {
    tx: oneshot::Sender<CallOutcome>,
    origin_peer_id: Option<PeerId>,
    target_peer_id: PeerId,
}

/// Table of outstanding calls, keyed by request id. One-shot resolution:
/// whichever of (response arrives / timeout fires / target disconnects /
/// caller cancels) happens first removes the entry and resolves the
/// waiter; all later attempts on the same id are no-ops (I2).
pub struct PendingCallTable {
    entries: Mutex<HashMap<RequestId, Entry>>,
    counter: AtomicU64,
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCallTable {
    pub fn new() -> Self {
        PendingCallTable {
            entries: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a waiter for `request_id`, returning the receiver half. The
    /// caller is responsible for racing it against a deadline (see
    /// `await_with_timeout`).
    pub async fn install(
        &self,
        request_id: RequestId,
        target_peer_id: PeerId,
        origin_peer_id: Option<PeerId>,
    ) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(
            request_id,
            Entry {
                tx,
                origin_peer_id,
                target_peer_id,
            },
        );
        rx
    }

    /// Resolve a pending call by request id (a response envelope whose id
    /// matched). Returns `false` (and logs at the call site) if the id is
    /// unknown — spec §4.4: "Spurious responses ... are logged and
    /// dropped (never throw)".
    pub async fn resolve(&self, request_id: RequestId, outcome: CallOutcome) -> bool {
        if let Some(entry) = self.entries.lock().await.remove(&request_id) {
            let _ = entry.tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Cancel and remove every pending call whose target is `peer_id`
    /// (spec §4.7: target disconnect resolves outstanding waiters with
    /// `TargetUnreachable`).
    pub async fn fail_calls_to_target(&self, peer_id: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let ids: Vec<RequestId> = entries
            .iter()
            .filter(|(_, e)| e.target_peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        let mut n = 0;
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                let _ = entry.tx.send(CallOutcome::Error(MeshError::TargetUnreachable));
                n += 1;
            }
        }
        n
    }

    /// Cancel every pending call (server shutdown, spec §5).
    pub async fn cancel_all(&self, outcome: MeshError) -> usize {
        let mut entries = self.entries.lock().await;
        let n = entries.len();
        for (_, entry) in entries.drain() {
            let _ = entry.tx.send(CallOutcome::Error(outcome.clone()));
        }
        n
    }

    pub async fn remove(&self, request_id: RequestId) -> bool {
        self.entries.lock().await.remove(&request_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Await a waiter's resolution bounded by `deadline`; on timeout,
    /// removes the entry itself (so no orphan remains, I2) and returns
    /// `MeshError::Timeout`.
    pub async fn await_with_timeout(
        &self,
        request_id: RequestId,
        rx: oneshot::Receiver<CallOutcome>,
        deadline: Duration,
    ) -> Result<Value, MeshError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(CallOutcome::Result(v))) => Ok(v),
            Ok(Ok(CallOutcome::Error(e))) => Err(e),
            // Sender dropped without resolving (e.g. controller shutting down
            // mid-flight) — treat the same as cancellation.
            Ok(Err(_)) => Err(MeshError::Cancelled),
            Err(_elapsed) => {
                self.remove(request_id).await;
                Err(MeshError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_completes_waiter() {
        let table = PendingCallTable::new();
        let id = table.next_request_id();
        let rx = table.install(id, "target".into(), None).await;
        assert!(table.resolve(id, CallOutcome::Result(serde_json::json!({"ok": true}))).await);
        let result = table.await_with_timeout(id, rx, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn unknown_id_resolve_is_noop() {
        let table = PendingCallTable::new();
        assert!(!table.resolve(999, CallOutcome::Result(serde_json::json!(null))).await);
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_surfaces_error() {
        let table = PendingCallTable::new();
        let id = table.next_request_id();
        let rx = table.install(id, "target".into(), None).await;
        let result = table
            .await_with_timeout(id, rx, Duration::from_millis(20))
            .await;
        assert_eq!(result.unwrap_err(), MeshError::Timeout);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn target_disconnect_fails_only_its_own_calls() {
        let table = PendingCallTable::new();
        let id_a = table.next_request_id();
        let rx_a = table.install(id_a, "p1".into(), None).await;
        let id_b = table.next_request_id();
        let rx_b = table.install(id_b, "p2".into(), None).await;

        let failed = table.fail_calls_to_target("p1").await;
        assert_eq!(failed, 1);

        let result_a = table.await_with_timeout(id_a, rx_a, Duration::from_secs(1)).await;
        assert_eq!(result_a.unwrap_err(), MeshError::TargetUnreachable);

        assert!(table.resolve(id_b, CallOutcome::Result(serde_json::json!(1))).await);
        let result_b = table.await_with_timeout(id_b, rx_b, Duration::from_secs(1)).await;
        assert!(result_b.is_ok());
    }
}
