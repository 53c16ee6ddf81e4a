use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use agentflow_core::error::{NodeErrorKind, NodeExecutionError};
use agentflow_core::traits::{CodeSandbox, NodeHandler, SandboxBindings};
use agentflow_core::types::*;

use super::config_str;

const DEFAULT_CODE: &str = "return input_data;";

/// Runs a user-supplied code fragment in the sandbox.
pub struct FunctionHandler {
    sandbox: Arc<dyn CodeSandbox>,
    default_timeout: Duration,
}

impl FunctionHandler {
    pub fn new(sandbox: Arc<dyn CodeSandbox>, default_timeout: Duration) -> Self {
        Self {
            sandbox,
            default_timeout,
        }
    }
}

/// `input` port, else the only bound port, else null.
fn input_data(inputs: &NodeInputs) -> Value {
    inputs
        .get(DEFAULT_INPUT_PORT)
        .or_else(|| inputs.single())
        .cloned()
        .unwrap_or(Value::Null)
}

impl NodeHandler for FunctionHandler {
    fn node_type(&self) -> &str {
        "function"
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        crate::catalog::function_descriptor()
    }

    fn execute(
        &self,
        config: NodeConfig,
        inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move {
            let code = config_str(&config, "code", &ctx)?
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(DEFAULT_CODE)
                .to_string();

            let timeout = match config.get("timeout_ms") {
                None | Some(Value::Null) => self.default_timeout,
                Some(v) => match v.as_u64() {
                    Some(ms) if ms > 0 => Duration::from_millis(ms),
                    _ => {
                        return Err(ctx.error(
                            NodeErrorKind::InvalidConfig,
                            "config 'timeout_ms' must be a positive integer",
                        ))
                    }
                },
            };

            let bindings = SandboxBindings {
                input_data: input_data(&inputs),
                inputs: inputs.to_value(),
            };

            debug!(node_id = %ctx.node_id, sandbox = self.sandbox.name(), "Evaluating user code");
            let value = self
                .sandbox
                .evaluate(code, bindings, timeout)
                .await
                .map_err(|e| ctx.error(e.node_kind(), e.to_string()))?;

            let mut outputs = NodeOutputs::new();
            outputs.insert(DEFAULT_OUTPUT_PORT.to_string(), value);
            Ok(outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RhaiSandbox;
    use serde_json::json;

    fn handler() -> FunctionHandler {
        FunctionHandler::new(Arc::new(RhaiSandbox::default()), Duration::from_secs(2))
    }

    fn ctx() -> NodeContext {
        NodeContext {
            run_id: RunId::new(),
            flow_id: "f".into(),
            node_id: "fn".into(),
            node_type: "function".into(),
            initial_input: None,
        }
    }

    fn code(src: &str) -> NodeConfig {
        let mut config = NodeConfig::new();
        config.insert("code".into(), json!(src));
        config
    }

    #[tokio::test]
    async fn test_default_code_passes_input_through() {
        let mut inputs = NodeInputs::new();
        inputs.insert("input", json!({"a": 1}));
        let out = handler().execute(NodeConfig::new(), inputs, ctx()).await.unwrap();
        assert_eq!(out["output"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_single_named_port_is_input_data() {
        let mut inputs = NodeInputs::new();
        inputs.insert("numbers", json!([1, 2, 3]));
        let out = handler()
            .execute(code("let total = 0; for n in input_data { total += n; } total"), inputs, ctx())
            .await
            .unwrap();
        assert_eq!(out["output"], json!(6));
    }

    #[tokio::test]
    async fn test_no_inputs_gives_null() {
        let out = handler()
            .execute(code(r#"type_of(input_data) == "()""#), NodeInputs::new(), ctx())
            .await
            .unwrap();
        assert_eq!(out["output"], json!(true));
    }

    #[tokio::test]
    async fn test_default_code_on_empty_input_is_null() {
        let out = handler().execute(NodeConfig::new(), NodeInputs::new(), ctx()).await.unwrap();
        assert_eq!(out["output"], Value::Null);
    }

    #[tokio::test]
    async fn test_script_error_is_contained() {
        let err = handler()
            .execute(code(r#"throw "bad input";"#), NodeInputs::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::Sandbox);
        assert_eq!(err.node_id, "fn");
        assert!(err.message.contains("bad input"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_node_timeout() {
        let mut config = code("loop { }");
        config.insert("timeout_ms".into(), json!(100));
        let err = handler().execute(config, NodeInputs::new(), ctx()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::SandboxTimeout);
    }

    #[tokio::test]
    async fn test_invalid_timeout_config() {
        let mut config = code("1");
        config.insert("timeout_ms".into(), json!("soon"));
        let err = handler().execute(config, NodeInputs::new(), ctx()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::InvalidConfig);
    }
}
