pub mod providers;
pub mod retry;
pub mod streaming;

use agentflow_core::config::ModelConfig;
use agentflow_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Provider client wrapped with the configured retry policy.
pub fn create_retrying_client(config: &ModelConfig) -> RetryingClient {
    RetryingClient::new(create_client(config), config.retry.clone())
}
