use std::time::Duration;

use futures::future::BoxFuture;

use agentflow_core::error::{NodeErrorKind, NodeExecutionError};
use agentflow_core::traits::NodeHandler;
use agentflow_core::types::*;

/// Emits its `input` port (or the whole input map) on `output`.
pub struct EchoHandler {
    tag: String,
}

impl EchoHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl NodeHandler for EchoHandler {
    fn node_type(&self) -> &str {
        &self.tag
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        NodeTypeDescriptor {
            node_type: self.tag.clone(),
            label: "Echo".into(),
            description: "Passes its input through unchanged".into(),
            inputs: vec![DEFAULT_INPUT_PORT.into()],
            outputs: vec![DEFAULT_OUTPUT_PORT.into()],
        }
    }

    fn execute(
        &self,
        _config: NodeConfig,
        inputs: NodeInputs,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move {
            let value = inputs
                .get(DEFAULT_INPUT_PORT)
                .cloned()
                .unwrap_or_else(|| inputs.to_value());
            let mut outputs = NodeOutputs::new();
            outputs.insert(DEFAULT_OUTPUT_PORT.into(), value);
            Ok(outputs)
        })
    }
}

/// Always fails with the given kind.
pub struct FailingHandler {
    tag: String,
    kind: NodeErrorKind,
}

impl FailingHandler {
    pub fn new(tag: impl Into<String>, kind: NodeErrorKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
        }
    }
}

impl NodeHandler for FailingHandler {
    fn node_type(&self) -> &str {
        &self.tag
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        NodeTypeDescriptor {
            node_type: self.tag.clone(),
            label: "Failing".into(),
            description: "Fails on every call".into(),
            inputs: vec![DEFAULT_INPUT_PORT.into()],
            outputs: vec![DEFAULT_OUTPUT_PORT.into()],
        }
    }

    fn execute(
        &self,
        _config: NodeConfig,
        _inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        let err = ctx.error(self.kind, "scripted failure");
        Box::pin(async move { Err(err) })
    }
}

/// Sleeps before echoing, with an optional handler-level timeout.
pub struct SlowHandler {
    tag: String,
    delay: Duration,
    timeout: Option<Duration>,
}

impl SlowHandler {
    pub fn new(tag: impl Into<String>, delay: Duration) -> Self {
        Self {
            tag: tag.into(),
            delay,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl NodeHandler for SlowHandler {
    fn node_type(&self) -> &str {
        &self.tag
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        NodeTypeDescriptor {
            node_type: self.tag.clone(),
            label: "Slow".into(),
            description: "Sleeps, then passes its input through".into(),
            inputs: vec![DEFAULT_INPUT_PORT.into()],
            outputs: vec![DEFAULT_OUTPUT_PORT.into()],
        }
    }

    fn execute(
        &self,
        _config: NodeConfig,
        inputs: NodeInputs,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let mut outputs = NodeOutputs::new();
            outputs.insert(DEFAULT_OUTPUT_PORT.into(), inputs.to_value());
            Ok(outputs)
        })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
