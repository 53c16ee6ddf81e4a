use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use agentflow_core::config::ModelConfig;
use agentflow_core::error::{NodeErrorKind, NodeExecutionError};
use agentflow_core::traits::{CompletionRequest, LlmClient, NodeHandler};
use agentflow_core::types::*;

use super::{config_str, value_to_text};

/// Sends a prompt to the configured language model.
pub struct LlmHandler {
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmHandler {
    pub fn new(client: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { client, model }
    }
}

/// Per-node overrides on top of the `[model]` section.
fn node_model(
    base: &ModelConfig,
    config: &NodeConfig,
    ctx: &NodeContext,
) -> Result<ModelConfig, NodeExecutionError> {
    let mut model = base.clone();
    if let Some(id) = config_str(config, "model", ctx)? {
        model.model_id = id.to_string();
    }
    match config.get("max_tokens") {
        None | Some(Value::Null) => {}
        Some(v) => {
            model.max_tokens = v
                .as_u64()
                .filter(|n| *n > 0 && *n <= u32::MAX as u64)
                .ok_or_else(|| {
                    ctx.error(
                        NodeErrorKind::InvalidConfig,
                        "config 'max_tokens' must be a positive integer",
                    )
                })? as u32;
        }
    }
    match config.get("temperature") {
        None | Some(Value::Null) => {}
        Some(v) => {
            model.temperature = v.as_f64().filter(|t| *t >= 0.0).ok_or_else(|| {
                ctx.error(
                    NodeErrorKind::InvalidConfig,
                    "config 'temperature' must be a non-negative number",
                )
            })? as f32;
        }
    }
    Ok(model)
}

/// `prompt` port, else `input` port, else config `prompt`.
fn resolve_prompt(
    config: &NodeConfig,
    inputs: &NodeInputs,
    ctx: &NodeContext,
) -> Result<String, NodeExecutionError> {
    if let Some(value) = inputs.get("prompt").or_else(|| inputs.get(DEFAULT_INPUT_PORT)) {
        return Ok(value_to_text(value));
    }
    Ok(config_str(config, "prompt", ctx)?.unwrap_or_default().to_string())
}

impl NodeHandler for LlmHandler {
    fn node_type(&self) -> &str {
        "llm"
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        crate::catalog::llm_descriptor()
    }

    fn execute(
        &self,
        config: NodeConfig,
        inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move {
            let model = node_model(&self.model, &config, &ctx)?;
            let prompt = resolve_prompt(&config, &inputs, &ctx)?;
            if prompt.trim().is_empty() {
                warn!(node_id = %ctx.node_id, "LLM node called with an empty prompt");
            }

            let request = CompletionRequest {
                system: config_str(&config, "system", &ctx)?.map(str::to_string),
                prompt,
            };

            debug!(
                node_id = %ctx.node_id,
                provider = %model.provider,
                model = %model.model_id,
                "Calling LLM"
            );
            let text = self
                .client
                .complete(&model, request)
                .await
                .map_err(|e| ctx.error(e.node_kind(), e.to_string()))?;

            let mut outputs = NodeOutputs::new();
            outputs.insert(DEFAULT_OUTPUT_PORT.to_string(), Value::String(text));
            Ok(outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::error::LlmError;
    use agentflow_test_utils::MockLlmClient;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext {
            run_id: RunId::new(),
            flow_id: "f".into(),
            node_id: "llm".into(),
            node_type: "llm".into(),
            initial_input: None,
        }
    }

    #[tokio::test]
    async fn test_prompt_port_preferred() {
        let mock = Arc::new(MockLlmClient::new().with_response("answer"));
        let handler = LlmHandler::new(mock.clone(), ModelConfig::default());

        let mut config = NodeConfig::new();
        config.insert("prompt".into(), json!("from config"));
        config.insert("system".into(), json!("be terse"));
        let mut inputs = NodeInputs::new();
        inputs.insert("input", json!("from input"));
        inputs.insert("prompt", json!("from prompt port"));

        let out = handler.execute(config, inputs, ctx()).await.unwrap();
        assert_eq!(out["output"], json!("answer"));

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "from prompt port");
        assert_eq!(requests[0].system.as_deref(), Some("be terse"));
    }

    #[tokio::test]
    async fn test_config_prompt_fallback() {
        let mock = Arc::new(MockLlmClient::new());
        let handler = LlmHandler::new(mock.clone(), ModelConfig::default());
        let mut config = NodeConfig::new();
        config.insert("prompt".into(), json!("static"));
        handler.execute(config, NodeInputs::new(), ctx()).await.unwrap();
        assert_eq!(mock.requests()[0].prompt, "static");
    }

    #[tokio::test]
    async fn test_missing_credential_kind() {
        let mock = Arc::new(
            MockLlmClient::new().with_error(LlmError::MissingCredential("no key".into())),
        );
        let handler = LlmHandler::new(mock, ModelConfig::default());
        let err = handler
            .execute(NodeConfig::new(), NodeInputs::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::MissingCredential);
    }

    #[test]
    fn test_node_overrides() {
        let mut config = NodeConfig::new();
        config.insert("model".into(), json!("gpt-4o-mini"));
        config.insert("max_tokens".into(), json!(64));
        config.insert("temperature".into(), json!(0.5));
        let model = node_model(&ModelConfig::default(), &config, &ctx()).unwrap();
        assert_eq!(model.model_id, "gpt-4o-mini");
        assert_eq!(model.max_tokens, 64);
        assert!((model.temperature - 0.5).abs() < f32::EPSILON);

        config.insert("max_tokens".into(), json!(-1));
        let err = node_model(&ModelConfig::default(), &config, &ctx()).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::InvalidConfig);
    }
}
