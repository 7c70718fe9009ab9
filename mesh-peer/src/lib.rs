//! Peer Controller library: dial-out, gossip, health checks, and multi-hop
//! routing for a full mesh node (spec §2 item 3, §4.6). A `mesh-peer` node
//! is the hub's counterpart — it can itself accept connections (spec §1's
//! "full peer node ... additionally accept[s] direct connections"), which
//! is why `connection.rs`'s accept gate recognizes both `node/register`
//! and `peer/handshake` as valid first messages.

pub mod config;
pub mod connection;
pub mod dial;
pub mod dispatch;
pub mod gossip;
pub mod health;
pub mod heartbeat;
pub mod local;
pub mod protocol;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use mesh_core::identity::{load_or_create_secret_key, MESH_ALPN, MESH_PEER_ALPN};
use mesh_core::ToolExecutor;
use mesh_vault::Vault;

use config::PeerConfig;
use state::PeerControllerState;

/// Bind the iroh endpoint, open the Federation Vault, install the
/// self-loop for `executor`'s tools, dial configured bootstrap peers, and
/// run until the process is asked to shut down. Blocks forever on success.
pub async fn run(config: PeerConfig, executor: Arc<dyn ToolExecutor>) -> Result<()> {
    if config.shared_secret.is_none() {
        tracing::warn!("MESH_SHARED_SECRET not set: peer/1 links will be rejected and dial-out will fail");
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let key_path = config.data_dir.join("iroh-key.secret");
    let secret_key = load_or_create_secret_key(&key_path)?;

    let vault = Arc::new(Vault::open(&config.vault_path).context("opening federation vault")?);

    let mut builder = iroh::Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![MESH_ALPN.to_vec(), MESH_PEER_ALPN.to_vec()]);
    if config.bind_port != 0 {
        builder = builder.bind_addr(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, config.bind_port))?;
    }
    let endpoint = builder.bind().await?;
    let self_node_id = endpoint.id().to_string();
    tracing::info!(node_id = %self_node_id, "peer iroh endpoint bound");

    let bootstrap_peers = config.bootstrap_peers.clone();
    let state = Arc::new(PeerControllerState::new(config, self_node_id, vault, executor));

    local::install(&state);

    let accept_state = Arc::clone(&state);
    let accept_endpoint = endpoint.clone();
    let accept_task = tokio::spawn(async move {
        while let Some(incoming) = accept_endpoint.accept().await {
            let state = Arc::clone(&accept_state);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => connection::handle_incoming(conn, state).await,
                    Err(e) => tracing::warn!("incoming connection failed: {e}"),
                }
            });
        }
        tracing::info!("accept loop ended");
    });

    let mut dial_tasks = Vec::new();
    for target in bootstrap_peers {
        let endpoint = endpoint.clone();
        let state = Arc::clone(&state);
        dial_tasks.push(tokio::spawn(async move {
            dial::dial_forever(endpoint, state, target).await;
        }));
    }

    let gossip_task = tokio::spawn(gossip::run(endpoint.clone(), Arc::clone(&state)));
    let heartbeat_task = tokio::spawn(heartbeat::run(Arc::clone(&state)));
    let ping_task = tokio::spawn(health::run_ping_loop(Arc::clone(&state)));

    let health_addr = state.config.health_addr.clone();
    let health_state = Arc::clone(&state);
    let health_task = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&health_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("failed to bind health listener on {health_addr}: {e}");
                return;
            }
        };
        tracing::info!("health endpoint listening on {health_addr}");
        if let Err(e) = axum::serve(listener, health::router(health_state)).await {
            tracing::error!("health server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    accept_task.abort();
    for t in dial_tasks {
        t.abort();
    }
    gossip_task.abort();
    heartbeat_task.abort();
    ping_task.abort();
    health_task.abort();
    state.pending.cancel_all(mesh_core::MeshError::Cancelled).await;
    drop(endpoint);
    Ok(())
}
