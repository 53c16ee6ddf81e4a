pub mod end;
pub mod function;
pub mod llm;
pub mod prompt;
pub mod start;

pub use end::EndHandler;
pub use function::FunctionHandler;
pub use llm::LlmHandler;
pub use prompt::PromptHandler;
pub use start::StartHandler;

use agentflow_core::error::{NodeErrorKind, NodeExecutionError};
use agentflow_core::types::{NodeConfig, NodeContext};

/// Read an optional string entry from node config.
pub(crate) fn config_str<'a>(
    config: &'a NodeConfig,
    key: &str,
    ctx: &NodeContext,
) -> Result<Option<&'a str>, NodeExecutionError> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ctx.error(
            NodeErrorKind::InvalidConfig,
            format!("config '{}' must be a string, got {}", key, other),
        )),
    }
}

/// Render any JSON value as prompt text: strings raw, everything else compact JSON.
pub(crate) fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
