//! Peer Controller acceptance tests: tool routing to a remote neighbor,
//! local tool execution through the self-loop (`local.rs`), and single-hop
//! `mesh/route` forwarding (spec §8, §4.6). Driven directly against
//! `mesh_peer::dispatch`/`PeerControllerState` with in-process mpsc
//! channels standing in for transports, same style as
//! `mesh-hub/tests/dispatch.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{CallOutcome, MeshError, NullExecutor, Peer, PeerState, ToolExecutor, TransportHandle};
use mesh_peer::config::PeerConfig;
use mesh_peer::dispatch;
use mesh_peer::state::PeerControllerState;
use mesh_vault::Vault;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

fn test_config(tmp: &tempfile::TempDir) -> PeerConfig {
    use clap::Parser;
    let mut config = PeerConfig::parse_from(["mesh-peer", "--node-id", "self", "--token", "t"]);
    config.vault_path = tmp.path().join("vault.json");
    config
}

fn test_state(tmp: &tempfile::TempDir, executor: Arc<dyn ToolExecutor>) -> Arc<PeerControllerState> {
    let vault = Arc::new(Vault::open(tmp.path().join("vault.json")).expect("open vault"));
    let config = test_config(tmp);
    Arc::new(PeerControllerState::new(config, "self".into(), vault, executor))
}

fn connected_peer(state: &PeerControllerState, peer_id: &str) -> mpsc::Receiver<mesh_core::Message> {
    let (tx, rx) = mpsc::channel(32);
    let mut peer = Peer::new(peer_id.to_string(), format!("{peer_id}.local"));
    peer.state = PeerState::Connected;
    peer.transport_in = Some(TransportHandle {
        tx,
        generation: 0,
        closer: Arc::new(Notify::new()),
    });
    state.peers.upsert(peer);
    rx
}

struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    fn tool_names(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<Value, MeshError> {
        match name {
            "echo" => Ok(args),
            other => Err(MeshError::NoProvider(other.to_string())),
        }
    }
}

/// A locally-hosted tool is served by the self-loop (`local.rs`) and
/// resolves through the exact same Pending-Call Table path a remote call
/// would use.
#[tokio::test]
async fn tools_call_is_served_locally_via_self_loop() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, Arc::new(EchoExecutor));
    mesh_peer::local::install(&state);
    // Give the self-loop's spawned task a chance to register.
    tokio::task::yield_now().await;

    let response = dispatch::dispatch(
        &state,
        "caller",
        mesh_core::Message::request(1, "tools/call", json!({ "name": "echo", "args": {"x": 1} })),
    )
    .await
    .expect("a response for a request id");
    assert_eq!(response.result, Some(json!({"x": 1})));
}

/// A `tools/call` for a tool advertised by a remote neighbor is forwarded
/// over that neighbor's transport and the reply is relayed back.
#[tokio::test]
async fn tools_call_forwards_to_remote_provider() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, Arc::new(NullExecutor));
    let mut rx = connected_peer(&state, "remote");
    state.tools.register_additive("remote", &["search".to_string()]);

    let state_for_call = Arc::clone(&state);
    let call = tokio::spawn(async move {
        dispatch::dispatch(
            &state_for_call,
            "caller",
            mesh_core::Message::request(1, "tools/call", json!({ "name": "search", "args": {} })),
        )
        .await
    });

    let forwarded = rx.recv().await.expect("forwarded to the remote provider");
    let request_id: u64 = forwarded.id_str().unwrap().parse().unwrap();
    assert!(state
        .pending
        .resolve(request_id, CallOutcome::Result(json!({"hits": []})))
        .await);

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.result, Some(json!({"hits": []})));
}

/// `mesh/route` to a directly-connected neighbor forwards straight there
/// (spec §4.6 "direct-neighbor-only forwarding").
#[tokio::test]
async fn route_forwards_directly_to_connected_target() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, Arc::new(NullExecutor));
    let mut rx = connected_peer(&state, "neighbor");

    let state_for_call = Arc::clone(&state);
    let call = tokio::spawn(async move {
        dispatch::dispatch(
            &state_for_call,
            "caller",
            mesh_core::Message::request(
                1,
                "mesh/route",
                json!({ "target": "neighbor", "message": {"method": "ping", "params": {}} }),
            ),
        )
        .await
    });

    let forwarded = rx.recv().await.expect("mesh/route relayed to the direct neighbor");
    assert_eq!(forwarded.method.as_deref(), Some("mesh/route"));
    let request_id: u64 = forwarded.id_str().unwrap().parse().unwrap();
    assert!(state.pending.resolve(request_id, CallOutcome::Result(Value::Null)).await);

    let response = call.await.unwrap().unwrap();
    assert!(response.error.is_none());
    assert_eq!(state.routes_forwarded.load(std::sync::atomic::Ordering::Relaxed), 1);
}

/// `mesh/route` whose target is this node dispatches locally instead of
/// forwarding anywhere.
#[tokio::test]
async fn route_to_self_dispatches_locally() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, Arc::new(EchoExecutor));
    mesh_peer::local::install(&state);
    tokio::task::yield_now().await;

    let response = dispatch::dispatch(
        &state,
        "caller",
        mesh_core::Message::request(
            1,
            "mesh/route",
            json!({ "target": "self", "message": {"method": "ping", "params": {}} }),
        ),
    )
    .await
    .expect("a response for a request id");
    assert!(response.error.is_none());
}

/// `mesh/route` with no path to the target exhausts its candidates and
/// fails `NoRoute` rather than hanging (spec §4.6).
#[tokio::test]
async fn route_with_no_candidates_fails_no_route() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, Arc::new(NullExecutor));

    let response = dispatch::dispatch(
        &state,
        "caller",
        mesh_core::Message::request(1, "mesh/route", json!({ "target": "nowhere", "message": {} })),
    )
    .await
    .unwrap();
    assert!(response.error.is_some());
}
