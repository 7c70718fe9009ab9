//! Hub Controller library: registration, routing, failure detection, and
//! the `/health` surface for the mesh coordination core (spec §2 item 2,
//! §4).

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod heartbeat;
pub mod protocol;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use mesh_core::identity::{load_or_create_secret_key, MESH_ALPN, MESH_PEER_ALPN};
use mesh_vault::Vault;

use config::HubConfig;
use state::HubState;

/// Bind the iroh endpoint, open the Federation Vault, and run the hub
/// until the process is asked to shut down. Blocks forever on success.
pub async fn run(config: HubConfig) -> Result<()> {
    if config.shared_secret.is_none() {
        tracing::warn!("MESH_SHARED_SECRET not set: peer/1 links will be rejected");
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
        builder = builder.bind_addr(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            config.bind_port,
        ))?;
    }
    let endpoint = builder.bind().await?;
    let hub_node_id = endpoint.id().to_string();
    tracing::info!(node_id = %hub_node_id, "hub iroh endpoint bound");

    let state = Arc::new(HubState::new(config.clone(), hub_node_id, vault));

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

    let heartbeat_task = tokio::spawn(heartbeat::run(Arc::clone(&state)));

    let health_addr = config.health_addr.clone();
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
    heartbeat_task.abort();
    health_task.abort();
    state.pending.cancel_all(mesh_core::MeshError::Cancelled).await;
    drop(endpoint);
    Ok(())
}
