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

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: BlockDelta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

pub(crate) fn parse_event(event: SseEvent) -> Option<Result<StreamDelta, LlmError>> {
    match serde_json::from_str::<StreamEvent>(&event.data) {
        Ok(StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        }) => Some(Ok(StreamDelta::TextDelta(text))),
        Ok(StreamEvent::MessageDelta { usage: Some(usage) }) => Some(Ok(StreamDelta::Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })),
        Ok(StreamEvent::MessageStop) => Some(Ok(StreamDelta::Stop)),
        Ok(StreamEvent::Error { error }) => {
            let msg = format!("{}: {}", error.kind, error.message);
            if error.kind == "overloaded_error" || error.kind == "rate_limit_error" {
                Some(Err(LlmError::Transient(msg)))
            } else {
                Some(Err(LlmError::Provider(msg)))
            }
        }
        Ok(_) => None,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse Anthropic SSE event");
            None
        }
    }
}

impl LlmClient for AnthropicClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta, LlmError>>, LlmError>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config.credential().ok_or_else(|| {
                LlmError::MissingCredential(
                    "no API key configured for provider 'anthropic' (set model.api_key)".into(),
                )
            })?;

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                messages: vec![ApiMessage {
                    role: "user",
                    content: request.prompt,
                }],
                system: request.system,
                stream: true,
            };

            let url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let mut req = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(model = %config.model_id, "Sending Anthropic request");
            let response = send_with_timeout(req, config.request_timeout_secs).await?;

            let delta_stream = SseStream::new(response.bytes_stream()).filter_map(|event| async move {
                match event {
                    Ok(event) => parse_event(event),
                    Err(e) => Some(Err(e)),
                }
            });

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta, LlmError>>)
        })
    }
}
