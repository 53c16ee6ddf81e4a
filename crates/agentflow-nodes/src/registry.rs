use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use agentflow_core::config::AppConfig;
use agentflow_core::error::{AgentflowError, NodeErrorKind, NodeExecutionError, Result};
use agentflow_core::traits::{LlmClient, NodeHandler};
use agentflow_core::types::*;

use crate::handlers::{EndHandler, FunctionHandler, LlmHandler, PromptHandler, StartHandler};
use crate::sandbox::RhaiSandbox;

/// Registry of node handlers, keyed by type tag.
///
/// Shared by every run behind an `Arc`. Tags are normalised through
/// [`NodeKind`], so `template` and `prompt` name the same handler.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn NodeHandler>>>,
}

fn canonical(tag: &str) -> String {
    NodeKind::from(tag).tag().to_string()
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under `tag`, returning the one it replaced.
    pub fn register(
        &self,
        tag: &str,
        handler: Arc<dyn NodeHandler>,
    ) -> Option<Arc<dyn NodeHandler>> {
        let tag = canonical(tag);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let replaced = handlers.insert(tag.clone(), handler);
        if replaced.is_some() {
            warn!(tag = %tag, "Replaced node handler");
        } else {
            debug!(tag = %tag, "Registered node handler");
        }
        replaced
    }

    /// Register a handler under its own `node_type()`.
    pub fn register_handler(&self, handler: impl NodeHandler) -> Option<Arc<dyn NodeHandler>> {
        let tag = handler.node_type().to_string();
        self.register(&tag, Arc::new(handler))
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn NodeHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers
            .get(&canonical(tag))
            .cloned()
            .ok_or_else(|| AgentflowError::UnknownNodeType(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.resolve(tag).is_ok()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut tags: Vec<String> = handlers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Descriptors of every registered handler, in tag order.
    pub fn catalog(&self) -> Vec<NodeTypeDescriptor> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(&String, &Arc<dyn NodeHandler>)> = handlers.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, h)| h.descriptor()).collect()
    }

    /// Dispatch to the handler for `ctx.node_type`, bounded by the handler's
    /// own timeout or `default_timeout`.
    pub async fn execute(
        &self,
        config: NodeConfig,
        inputs: NodeInputs,
        ctx: NodeContext,
        default_timeout: Duration,
    ) -> std::result::Result<NodeOutputs, NodeExecutionError> {
        let handler = self
            .resolve(&ctx.node_type)
            .map_err(|e| ctx.error(NodeErrorKind::Internal, e.to_string()))?;

        let timeout = handler.timeout().unwrap_or(default_timeout);
        let err_ctx = ctx.clone();

        match tokio::time::timeout(timeout, handler.execute(config, inputs, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(err_ctx.error(
                NodeErrorKind::Timeout,
                format!("handler did not finish within {}ms", timeout.as_millis()),
            )),
        }
    }

    /// Create a registry with the five built-in handlers registered.
    pub fn with_builtins(config: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let registry = Self::new();
        let sandbox = Arc::new(RhaiSandbox::new(config.sandbox.clone()));

        registry.register_handler(StartHandler);
        registry.register_handler(PromptHandler);
        registry.register_handler(FunctionHandler::new(
            sandbox,
            Duration::from_millis(config.sandbox.timeout_ms),
        ));
        registry.register_handler(LlmHandler::new(llm, config.model.clone()));
        registry.register_handler(EndHandler);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_test_utils::{EchoHandler, MockLlmClient, SlowHandler};
    use serde_json::json;

    fn builtins() -> HandlerRegistry {
        HandlerRegistry::with_builtins(&AppConfig::default(), Arc::new(MockLlmClient::new()))
    }

    fn ctx(node_type: &str) -> NodeContext {
        NodeContext {
            run_id: RunId::new(),
            flow_id: "f".into(),
            node_id: "n".into(),
            node_type: node_type.into(),
            initial_input: None,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = builtins();
        assert_eq!(registry.tags(), vec!["end", "function", "llm", "prompt", "start"]);
        assert!(registry.contains("template"));
        assert!(registry.contains("code"));
        assert!(registry.contains("llm_call"));
        assert_eq!(registry.catalog().len(), 5);
    }

    #[test]
    fn test_unknown_type() {
        let err = builtins().resolve("sentiment").err().unwrap();
        assert!(matches!(err, AgentflowError::UnknownNodeType(t) if t == "sentiment"));
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let registry = builtins();
        let previous = registry.register("prompt", Arc::new(EchoHandler::new("prompt")));
        assert!(previous.is_some());
        assert_eq!(registry.resolve("prompt").unwrap().descriptor().label, "Echo");

        let fresh = registry.register_handler(EchoHandler::new("sentiment"));
        assert!(fresh.is_none());
        assert!(registry.contains("sentiment"));
    }

    #[tokio::test]
    async fn test_execute_dispatches() {
        let registry = builtins();
        let mut config = NodeConfig::new();
        config.insert("template".into(), json!("hi {who}"));
        let mut inputs = NodeInputs::new();
        inputs.insert("who", json!("there"));
        let out = registry
            .execute(config, inputs, ctx("prompt"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out["output"], json!("hi there"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let registry = HandlerRegistry::new();
        registry.register_handler(
            SlowHandler::new("slow", Duration::from_secs(60)).with_timeout(Duration::from_secs(1)),
        );
        let err = registry
            .execute(NodeConfig::new(), NodeInputs::new(), ctx("slow"), Duration::from_secs(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::Timeout);
    }
}
