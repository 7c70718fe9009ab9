use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mesh_core::NullExecutor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("MESH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("mesh_peer=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = mesh_peer::config::PeerConfig::parse();
    tracing::info!(node_id = %config.node_id, "starting mesh-peer");
    // The standalone binary carries no locally-hosted tools of its own —
    // it is a pure relay/federation node. `mesh-bots` embeds this same
    // library with a real `ToolExecutor` to host tools directly.
    mesh_peer::run(config, Arc::new(NullExecutor)).await
}
