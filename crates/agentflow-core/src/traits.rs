use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};

use crate::config::ModelConfig;
use crate::error::{LlmError, NodeExecutionError, Result, SandboxError};
use crate::types::*;

/// Node handler: the type-specific logic behind a node tag.
pub trait NodeHandler: Send + Sync + 'static {
    /// Tag this handler serves by default (e.g. "prompt").
    fn node_type(&self) -> &str;

    /// Catalog entry for authoring tools.
    fn descriptor(&self) -> NodeTypeDescriptor;

    /// Compute the node's outputs from its configuration and resolved inputs.
    fn execute(
        &self,
        config: NodeConfig,
        inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<NodeOutputs, NodeExecutionError>>;

    /// Handler-specific bound, overriding the engine's node timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// A single-turn completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
        }
    }
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    TextDelta(String),
    Usage { input_tokens: u64, output_tokens: u64 },
    Stop,
}

/// LLM client: multi-provider streaming.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, std::result::Result<BoxStream<'_, std::result::Result<StreamDelta, LlmError>>, LlmError>>;

    /// Send a request and collect the streamed text.
    fn complete<'a>(
        &'a self,
        config: &'a ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, LlmError>> {
        Box::pin(async move {
            let mut stream = self.chat_stream(config, request).await?;
            let mut text = String::new();
            while let Some(delta) = stream.next().await {
                if let StreamDelta::TextDelta(chunk) = delta? {
                    text.push_str(&chunk);
                }
            }
            Ok(text)
        })
    }
}

/// Values exposed to a user-code fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxBindings {
    /// The single upstream value, or null.
    pub input_data: serde_json::Value,
    /// Every resolved input port.
    pub inputs: serde_json::Value,
}

/// Isolated evaluator for untrusted code. Implementations must not share
/// mutable state with the caller or between evaluations.
pub trait CodeSandbox: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        code: String,
        bindings: SandboxBindings,
        timeout: Duration,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, SandboxError>>;
}

/// Flow store: definitions keyed by flow id.
pub trait FlowStore: Send + Sync + 'static {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    /// Insert or replace a flow, returning the stored copy.
    fn put(&self, flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>>;

    /// Returns whether a flow was removed.
    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>>;
}

/// Run store: append-only execution records.
pub trait RunStore: Send + Sync + 'static {
    /// Record a finished run. A run id can be appended once.
    fn append(&self, run: &ExecutionRun) -> BoxFuture<'_, Result<()>>;

    fn get(&self, run_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRun>>>;

    /// Runs of a flow, newest first.
    fn list_for_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionRun>>>;
}
