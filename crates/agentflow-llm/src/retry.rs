use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::warn;

use agentflow_core::config::{ModelConfig, RetryConfig};
use agentflow_core::error::LlmError;
use agentflow_core::traits::{CompletionRequest, LlmClient, StreamDelta};

/// An LLM client that retries transient failures with exponential backoff.
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta, LlmError>>, LlmError>> {
        let config = config.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.chat_stream(&config, request.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) if e.is_transient() && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying LLM request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    /// Retries the whole completion, so a stream cut off mid-response is
    /// re-requested from the start instead of resumed.
    fn complete<'a>(
        &'a self,
        config: &'a ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'a, Result<String, LlmError>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.complete(config, request.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) if e.is_transient() && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying LLM completion"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Scripted {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, LlmError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    script: Mutex::new(script.into()),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl LlmClient for Scripted {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _request: CompletionRequest,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta, LlmError>>, LlmError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Provider("script exhausted".into())));
            Box::pin(async move {
                let text = next?;
                let deltas = vec![Ok(StreamDelta::TextDelta(text)), Ok(StreamDelta::Stop)];
                Ok(Box::pin(futures::stream::iter(deltas))
                    as BoxStream<'_, Result<StreamDelta, LlmError>>)
            })
        }
    }

    fn retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        let first = calculate_backoff(0, &config);
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        let late = calculate_backoff(20, &config);
        assert!(late <= Duration::from_millis(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let (inner, calls) = Scripted::new(vec![
            Err(LlmError::Transient("HTTP 503".into())),
            Err(LlmError::Transient("HTTP 429".into())),
            Ok("hello".into()),
        ]);
        let client = RetryingClient::new(Box::new(inner), retry_config(3));
        let text = client
            .complete(&ModelConfig::default(), CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (inner, calls) = Scripted::new(vec![
            Err(LlmError::Transient("a".into())),
            Err(LlmError::Transient("b".into())),
            Err(LlmError::Transient("c".into())),
        ]);
        let client = RetryingClient::new(Box::new(inner), retry_config(2));
        let err = client
            .complete(&ModelConfig::default(), CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Transient("c".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let (inner, calls) = Scripted::new(vec![
            Err(LlmError::MissingCredential("no key".into())),
            Ok("unreachable".into()),
        ]);
        let client = RetryingClient::new(Box::new(inner), retry_config(3));
        let err = client
            .complete(&ModelConfig::default(), CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
