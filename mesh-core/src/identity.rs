//! Persistent iroh endpoint identity and ALPN constants.
//!
//! Grounded on `freeq-server/src/iroh.rs`'s `load_or_create_secret_key`: a
//! stable identity across restarts matters here too, since peer_id
//! continuity is what makes reconnect (I6) meaningful rather than just
//! spawning a new anonymous peer every time.

use std::path::Path;

use anyhow::{Context, Result};

/// ALPN for client-to-hub / client-to-peer connections (registration,
/// tool calls, admin queries).
pub const MESH_ALPN: &[u8] = b"mesh/node/1";

/// ALPN for peer-to-peer links (handshake, gossip, health pings,
/// multi-hop routing).
pub const MESH_PEER_ALPN: &[u8] = b"mesh/peer/1";

pub fn load_or_create_secret_key(path: &Path) -> Result<iroh::SecretKey> {
    if path.exists() {
        let hex = std::fs::read_to_string(path)
            .with_context(|| format!("reading iroh secret key at {}", path.display()))?;
        let key: iroh::SecretKey = hex
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid iroh secret key in {}: {e}", path.display()))?;
        Ok(key)
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        let hex: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, &hex)
            .with_context(|| format!("writing iroh secret key to {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new node identity");
        Ok(key)
    }
}
