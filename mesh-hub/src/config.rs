//! Hub configuration (spec §6's enumerated configuration fields).
//!
//! Grounded on `freeq-server/src/config.rs`'s `clap::Parser` shape (trimmed
//! to the fields the Hub actually needs) — every field is overridable by
//! environment variable via clap's `env` feature, matching the teacher.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "mesh-hub", about = "Mesh Coordination Core — Hub Controller")]
pub struct HubConfig {
    /// Address the hub's iroh endpoint listens on.
    #[arg(long, env = "MESH_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// UDP port for the iroh endpoint. 0 lets the OS pick one.
    #[arg(long, env = "MESH_BIND_PORT", default_value_t = 0)]
    pub bind_port: u16,

    /// Address the `/health` HTTP endpoint listens on.
    #[arg(long, env = "MESH_HEALTH_ADDR", default_value = "127.0.0.1:8090")]
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

    /// Replay window for signed server-to-server envelopes, seconds.
    #[arg(long, env = "MESH_ENVELOPE_WINDOW_S", default_value_t = 300)]
    pub signed_envelope_window_s: i64,

    /// Shared HMAC secret for signing/verifying Hub↔Peer links. Required
    /// for any `mesh-peer` to federate with this hub (§4.1, §7 `ConfigFatal`).
    #[arg(long, env = "MESH_SHARED_SECRET")]
    pub shared_secret: Option<String>,

    /// Path to the Federation Vault's persisted JSON file.
    #[arg(long, env = "MESH_VAULT_PATH", default_value = "vault/federation_tokens.json")]
    pub vault_path: PathBuf,

    /// Directory holding this hub's persistent iroh identity key.
    #[arg(long, env = "MESH_DATA_DIR", default_value = "data/hub")]
    pub data_dir: PathBuf,
}

impl HubConfig {
    pub fn heartbeat_thresholds(&self) -> mesh_core::HeartbeatThresholds {
        mesh_core::HeartbeatThresholds {
            degraded_after: std::time::Duration::from_secs(self.heartbeat_degraded_s),
            offline_after: std::time::Duration::from_secs(self.heartbeat_offline_s),
        }
    }
}
