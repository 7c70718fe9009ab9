//! Shared building blocks for the mesh coordination core: wire protocol,
//! signed envelopes, node identity, and the bookkeeping tables (Peer Table,
//! Tool Index, Pending-Call Table, Known Peers) that `mesh-hub` and
//! `mesh-peer` both build their controllers around.

pub mod envelope;
pub mod error;
pub mod executor;
pub mod gossip;
pub mod identity;
pub mod peer;
pub mod pending;
pub mod tool_index;
pub mod transport;
pub mod wire;

pub use error::{MeshError, MeshResult};
pub use executor::{NullExecutor, ToolExecutor};
pub use gossip::{GossipRecord, KnownPeers};
pub use peer::{HeartbeatThresholds, Peer, PeerId, PeerState, PeerSummary, PeerTable, TransportHandle};
pub use pending::{CallOutcome, PendingCallTable, RequestId, DEFAULT_CALL_TIMEOUT};
pub use tool_index::ToolIndex;
pub use wire::Message;
