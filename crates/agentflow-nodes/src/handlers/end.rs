use futures::future::BoxFuture;

use agentflow_core::error::NodeExecutionError;
use agentflow_core::traits::NodeHandler;
use agentflow_core::types::*;

/// Terminal node. Its resolved inputs become the run's final output.
pub struct EndHandler;

impl NodeHandler for EndHandler {
    fn node_type(&self) -> &str {
        "end"
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        crate::catalog::end_descriptor()
    }

    fn execute(
        &self,
        _config: NodeConfig,
        _inputs: NodeInputs,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move { Ok(NodeOutputs::new()) })
    }
}
