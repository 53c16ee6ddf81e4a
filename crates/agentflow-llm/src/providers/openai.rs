use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agentflow_core::config::ModelConfig;
use agentflow_core::error::LlmError;
use agentflow_core::traits::{CompletionRequest, LlmClient, StreamDelta};

use super::send_with_timeout;
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_messages(request: CompletionRequest) -> Vec<OaiMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system {
        messages.push(OaiMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: request.prompt,
    });
    messages
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta, LlmError>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => {
            let mut deltas = Vec::new();

            if let Some(usage) = chunk.usage {
                deltas.push(Ok(StreamDelta::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }));
            }

            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(text) = choice.delta.and_then(|d| d.content) {
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(text)));
                    }
                }
                if choice.finish_reason.is_some() {
                    deltas.push(Ok(StreamDelta::Stop));
                }
            }

            deltas
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            vec![]
        }
    }
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta, LlmError>>, LlmError>> {
        let config = config.clone();

        Box::pin(async move {
            // A custom endpoint (Ollama, vLLM) may not need a key; the hosted API does.
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let credential = config.credential();
            if credential.is_none() && config.base_url.is_none() {
                return Err(LlmError::MissingCredential(
                    "no API key configured for provider 'openai' (set model.api_key)".into(),
                ));
            }

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: build_messages(request),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                stream: true,
            };

            let mut req = self.http.post(base_url).json(&body);
            if let Some(api_key) = credential {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(model = %config.model_id, url = %base_url, "Sending OpenAI-compatible request");
            let response = send_with_timeout(req, config.request_timeout_secs).await?;

            let delta_stream = SseStream::new(response.bytes_stream())
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta, LlmError>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_delta() {
        let deltas = parse_chunk(event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert_eq!(deltas, vec![Ok(StreamDelta::TextDelta("Hel".into()))]);
    }

    #[test]
    fn test_parse_finish_and_done() {
        let deltas = parse_chunk(event(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        assert_eq!(deltas, vec![Ok(StreamDelta::Stop)]);
        assert!(parse_chunk(event("[DONE]")).is_empty());
    }

    #[test]
    fn test_system_message_first() {
        let messages = build_messages(CompletionRequest {
            system: Some("be brief".into()),
            prompt: "hi".into(),
        });
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
    }

    #[tokio::test]
    async fn test_missing_key_for_hosted_api() {
        let client = OpenAiClient::new();
        let config = ModelConfig::default();
        let err = client
            .complete(&config, CompletionRequest::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential(_)));
    }
}
