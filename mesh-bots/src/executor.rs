//! A small demo `ToolExecutor` (spec §1's opaque tool-provider contract):
//! a handful of toy tools so `mesh-bots` has something real to advertise
//! when it joins a mesh, grounded on `freeq-bots`'s pattern of a single
//! process owning a fixed set of named capabilities it can `invoke`.

use async_trait::async_trait;
use mesh_core::{MeshError, ToolExecutor};
use serde_json::{json, Value};

pub struct DemoExecutor;

#[async_trait]
impl ToolExecutor for DemoExecutor {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, MeshError> {
        match name {
            "echo" => Ok(args),
            "time" => Ok(json!({ "unix": mesh_core::envelope::now_unix() })),
            "add" => {
                let numbers = args
                    .get("numbers")
                    .and_then(Value::as_array)
                    .ok_or_else(|| MeshError::MalformedEnvelope("add requires an array field \"numbers\"".to_string()))?;
                let mut sum = 0f64;
                for n in numbers {
                    sum += n
                        .as_f64()
                        .ok_or_else(|| MeshError::MalformedEnvelope("numbers must all be numeric".to_string()))?;
                }
                Ok(json!({ "sum": sum }))
            }
            other => Err(MeshError::NoProvider(other.to_string())),
        }
    }

    fn tool_names(&self) -> Vec<String> {
        vec!["echo".to_string(), "time".to_string(), "add".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_its_input() {
        let out = DemoExecutor.invoke("echo", json!({"hello": "world"})).await.unwrap();
        assert_eq!(out, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn add_sums_the_numbers_field() {
        let out = DemoExecutor.invoke("add", json!({"numbers": [1, 2, 3.5]})).await.unwrap();
        assert_eq!(out, json!({"sum": 6.5}));
    }

    #[tokio::test]
    async fn add_rejects_missing_field() {
        let err = DemoExecutor.invoke("add", json!({})).await.unwrap_err();
        assert!(matches!(err, MeshError::MalformedEnvelope(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let err = DemoExecutor.invoke("nope", json!(null)).await.unwrap_err();
        assert!(matches!(err, MeshError::NoProvider(_)));
    }

    #[test]
    fn advertises_three_tools() {
        assert_eq!(DemoExecutor.tool_names().len(), 3);
    }
}
