//! The opaque tool-executor interface (spec §1: "the core consumes a
//! tool-executor interface (invoke(name, args) → result|error)").
//!
//! The coordination core never knows what a tool *does* — it only needs
//! something it can hand `(name, args)` to and get back a result or a
//! `MeshError`. `mesh-peer` holds one `Arc<dyn ToolExecutor>` and uses it to
//! serve `tools/call` requests for the tools it hosts locally, exactly the
//! way `freeq-bots` sits behind `freeq-sdk`'s client handle as an opaque
//! consumer rather than something the server/SDK layer knows about.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::MeshError;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Names of the tools this executor can serve, used to populate
    /// `advertised_tools` at registration time.
    fn tool_names(&self) -> Vec<String>;

    /// Invoke `name` with `args`, returning its result or a `MeshError`
    /// (typically `MeshError::NoProvider` if `name` is unrecognized, or
    /// `MeshError::Internal` for a failure inside the tool itself).
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, MeshError>;
}

/// An executor with no tools — the default when a node only routes calls
/// and never serves any itself.
pub struct NullExecutor;

#[async_trait]
impl ToolExecutor for NullExecutor {
    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, name: &str, _args: Value) -> Result<Value, MeshError> {
        Err(MeshError::NoProvider(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_executor_has_no_tools_and_refuses_calls() {
        let exec = NullExecutor;
        assert!(exec.tool_names().is_empty());
        let err = exec.invoke("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, MeshError::NoProvider(_)));
    }
}
