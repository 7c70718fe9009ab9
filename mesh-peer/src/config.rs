//! Peer configuration (spec §6's enumerated fields, plus the dial-out
//! fields `node/register` alone doesn't need: this node's own claimed
//! identity/token and the bootstrap peers it dials on startup).
//!
//! Grounded on `freeq-server/src/config.rs`'s `clap::Parser` shape, the same
//! way `mesh-hub/src/config.rs` is.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "mesh-peer", about = "Mesh Coordination Core — Peer Controller")]
pub struct PeerConfig {
    /// This node's claimed identifier, registered in advance with some
    /// vault (its own, or a hub's) via `mesh-vault-admin register`.
    #[arg(long, env = "MESH_NODE_ID")]
    pub node_id: String,

    /// Bearer token for `node_id`, as returned by `mesh-vault-admin register`.
    #[arg(long, env = "MESH_NODE_TOKEN")]
    pub token: String,

    /// Display hostname advertised at handshake time.
    #[arg(long, env = "MESH_HOSTNAME", default_value = "")]
    pub hostname: String,

    /// Iroh node ids (or node tickets) to dial on startup and whenever the
    /// link drops (spec §4.6: "dials configured bootstrap peers and/or a
    /// hub"). May include the hub's id.
    #[arg(long = "bootstrap", env = "MESH_BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peers: Vec<String>,

    /// UDP port for this node's iroh endpoint. 0 lets the OS pick one.
    #[arg(long, env = "MESH_BIND_PORT", default_value_t = 0)]
    pub bind_port: u16,

    /// Address the `/health` HTTP endpoint listens on.
    #[arg(long, env = "MESH_HEALTH_ADDR", default_value = "127.0.0.1:8091")]
    pub health_addr: String,

    /// Seconds of heartbeat silence before a peer is demoted to Degraded.
    #[arg(long, env = "MESH_HEARTBEAT_DEGRADED_S", default_value_t = 60)]
    pub heartbeat_degraded_s: u64,

    /// Seconds of heartbeat silence before a peer is demoted to Offline.
    #[arg(long, env = "MESH_HEARTBEAT_OFFLINE_S", default_value_t = 90)]
    pub heartbeat_offline_s: u64,

    /// How often the heartbeat reaper sweeps the peer table.
    #[arg(long, env = "MESH_HEARTBEAT_SWEEP_S", default_value_t = 10)]
    pub heartbeat_sweep_s: u64,

    /// Default deadline for a `tools/call` awaiting its response.
    #[arg(long, env = "MESH_CALL_TIMEOUT_S", default_value_t = 120)]
    pub call_default_timeout_s: u64,

    /// Default TTL for `mesh/broadcast` hop-counting.
    #[arg(long, env = "MESH_BROADCAST_TTL", default_value_t = 3)]
    pub broadcast_default_ttl: u32,

    /// Interval between `peer/gossip` rounds (spec §4.6, ~30s).
    #[arg(long, env = "MESH_GOSSIP_INTERVAL_S", default_value_t = 30)]
    pub gossip_interval_s: u64,

    /// Interval between health pings to each connected peer (spec §4.6, ~15s).
    #[arg(long, env = "MESH_PING_INTERVAL_S", default_value_t = 15)]
    pub ping_interval_s: u64,

    /// Deadline for a single health ping (spec §4.6, 5s).
    #[arg(long, env = "MESH_PING_TIMEOUT_S", default_value_t = 5)]
    pub ping_timeout_s: u64,

    /// Replay window for signed server-to-server envelopes, seconds.
    #[arg(long, env = "MESH_ENVELOPE_WINDOW_S", default_value_t = 300)]
    pub signed_envelope_window_s: i64,

    /// Shared HMAC secret for signing/verifying peer/1 links. Required to
    /// dial out or accept any federated link (§7 `ConfigFatal`).
    #[arg(long, env = "MESH_SHARED_SECRET")]
    pub shared_secret: Option<String>,

    /// Path to this node's own Federation Vault file, used to authenticate
    /// *inbound* dials from other peers/tool-providers.
    #[arg(long, env = "MESH_VAULT_PATH", default_value = "vault/federation_tokens.json")]
    pub vault_path: PathBuf,

    /// Directory holding this node's persistent iroh identity key.
    #[arg(long, env = "MESH_DATA_DIR", default_value = "data/peer")]
    pub data_dir: PathBuf,
}

impl PeerConfig {
    pub fn heartbeat_thresholds(&self) -> mesh_core::HeartbeatThresholds {
        mesh_core::HeartbeatThresholds {
            degraded_after: std::time::Duration::from_secs(self.heartbeat_degraded_s),
            offline_after: std::time::Duration::from_secs(self.heartbeat_offline_s),
        }
    }
}
