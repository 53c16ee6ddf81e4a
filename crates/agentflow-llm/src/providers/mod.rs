pub mod anthropic;
pub mod openai;

use std::time::Duration;

use agentflow_core::error::LlmError;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// Send a request under the per-attempt timeout, classifying failures.
pub(crate) async fn send_with_timeout(
    req: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<reqwest::Response, LlmError> {
    let response = tokio::time::timeout(Duration::from_secs(timeout_secs), req.send())
        .await
        .map_err(|_| LlmError::Transient(format!("request timed out after {}s", timeout_secs)))?
        .map_err(classify_reqwest_error)?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(LlmError::from_status(status, &body));
    }
    Ok(response)
}

pub(crate) fn classify_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        LlmError::Transient(e.to_string())
    } else {
        LlmError::Provider(e.to_string())
    }
}
