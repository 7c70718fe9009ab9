//! mesh-bots: a small example tool-executor binary (spec §1's "opaque
//! tool-executor interface" demonstrated end to end) — embeds `mesh-peer`
//! as a library and plugs in a `DemoExecutor` so its `echo`/`time`/`add`
//! tools are reachable from anywhere in the mesh via `tools/call`.

mod executor;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use executor::DemoExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("MESH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("mesh_bots=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = mesh_peer::config::PeerConfig::parse();
    tracing::info!(node_id = %config.node_id, tools = "echo,time,add", "starting mesh-bots");
    mesh_peer::run(config, Arc::new(DemoExecutor)).await
}
