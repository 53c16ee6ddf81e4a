use futures::future::BoxFuture;
use serde_json::Value;

use agentflow_core::error::NodeExecutionError;
use agentflow_core::traits::NodeHandler;
use agentflow_core::types::*;

/// Entry point of a flow. Emits the run's initial input.
pub struct StartHandler;

fn initial_value(config: &NodeConfig, ctx: &NodeContext) -> Value {
    if let Some(value) = &ctx.initial_input {
        return value.clone();
    }
    config
        .get("initial_value")
        .or_else(|| config.get("initialValue"))
        .cloned()
        .unwrap_or(Value::Null)
}

impl NodeHandler for StartHandler {
    fn node_type(&self) -> &str {
        "start"
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        crate::catalog::start_descriptor()
    }

    fn execute(
        &self,
        config: NodeConfig,
        _inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move {
            let value = initial_value(&config, &ctx);
            let mut outputs = NodeOutputs::new();
            // Object fields double as named ports so edges can pick one out.
            if let Value::Object(fields) = &value {
                for (key, field) in fields {
                    if key != DEFAULT_OUTPUT_PORT {
                        outputs.insert(key.clone(), field.clone());
                    }
                }
            }
            outputs.insert(DEFAULT_OUTPUT_PORT.to_string(), value);
            Ok(outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(initial_input: Option<Value>) -> NodeContext {
        NodeContext {
            run_id: RunId::new(),
            flow_id: "f".into(),
            node_id: "start".into(),
            node_type: "start".into(),
            initial_input,
        }
    }

    #[tokio::test]
    async fn test_initial_input_overrides_config() {
        let mut config = NodeConfig::new();
        config.insert("initial_value".into(), json!("from config"));
        let out = StartHandler
            .execute(config, NodeInputs::new(), ctx(Some(json!("from run"))))
            .await
            .unwrap();
        assert_eq!(out["output"], json!("from run"));
    }

    #[tokio::test]
    async fn test_camel_case_alias_and_null_default() {
        let mut config = NodeConfig::new();
        config.insert("initialValue".into(), json!(7));
        let out = StartHandler
            .execute(config, NodeInputs::new(), ctx(None))
            .await
            .unwrap();
        assert_eq!(out["output"], json!(7));

        let out = StartHandler
            .execute(NodeConfig::new(), NodeInputs::new(), ctx(None))
            .await
            .unwrap();
        assert_eq!(out["output"], Value::Null);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_object_fields_become_ports() {
        let out = StartHandler
            .execute(
                NodeConfig::new(),
                NodeInputs::new(),
                ctx(Some(json!({"name": "World", "n": 2}))),
            )
            .await
            .unwrap();
        assert_eq!(out["name"], json!("World"));
        assert_eq!(out["n"], json!(2));
        assert_eq!(out["output"], json!({"name": "World", "n": 2}));
    }
}
