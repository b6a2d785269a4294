use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use plait_core::config::{ModelConfig, RetryConfig};
use plait_core::error::{PlaitError, Result};
use plait_core::traits::LlmClient;
use plait_core::types::{ChatMessage, StreamDelta};

/// Request failures that look transient. Matched case-insensitively.
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "connection",
    "overloaded",
];

/// An alternate model tried once the primary gives up.
struct Fallback {
    model: ModelConfig,
    client: Box<dyn LlmClient>,
}

/// Retries the primary client with exponential back-off, then tries each
/// fallback model once, in order.
///
/// Only opening the stream is retried. Errors inside an open stream reach
/// the caller, which decides whether to restart the whole call.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<Fallback>,
    policy: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks: fallbacks
                .into_iter()
                .map(|(model, client)| Fallback { model, client })
                .collect(),
            policy,
        }
    }

    pub fn fallback_count(&self) -> usize {
        self.fallbacks.len()
    }

    async fn open_primary(
        &self,
        model: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'_, Result<StreamDelta>>> {
        let mut attempt: u32 = 0;
        loop {
            match self.primary.chat_stream(model, messages.to_vec()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.policy.max_retries && is_transient(&e) => {
                    let delay = backoff(attempt, &self.policy);
                    attempt += 1;
                    warn!(
                        model = %model.model_id,
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient LLM failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(e: &PlaitError) -> bool {
    match e {
        PlaitError::LlmStream(_) => true,
        PlaitError::LlmRequest(msg) => {
            let msg = msg.to_ascii_lowercase();
            TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker))
        }
        _ => false,
    }
}

/// Exponential delay capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
fn backoff(attempt: u32, policy: &RetryConfig) -> Duration {
    let base = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let primary_err = match self.open_primary(&config, &messages).await {
                Ok(stream) => return Ok(stream),
                // A refusal or an interruption is an answer, not an outage.
                Err(e) if matches!(e, PlaitError::LlmRejected(_) | PlaitError::Interrupted(_)) => {
                    return Err(e)
                }
                Err(e) => e,
            };

            for fallback in &self.fallbacks {
                info!(
                    model = %fallback.model.model_id,
                    provider = %fallback.model.provider,
                    error = %primary_err,
                    "Primary model unavailable, trying fallback"
                );
                match fallback.client.chat_stream(&fallback.model, messages.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        warn!(model = %fallback.model.model_id, error = %e, "Fallback model failed");
                    }
                }
            }

            Err(primary_err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;
    use plait_core::types::StopReason;

    /// Fails the first `failures` calls with `error`, then streams "ok".
    struct Flaky {
        calls: Arc<AtomicUsize>,
        failures: usize,
        error: fn() -> PlaitError,
    }

    impl Flaky {
        fn new(failures: usize, error: fn() -> PlaitError) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: calls.clone(),
                    failures,
                    error,
                },
                calls,
            )
        }
    }

    impl LlmClient for Flaky {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let err = (n < self.failures).then(self.error);
            Box::pin(async move {
                if let Some(err) = err {
                    return Err(err);
                }
                let items = vec![
                    Ok(StreamDelta::TextDelta("ok".into())),
                    Ok(StreamDelta::Stop(StopReason::EndTurn)),
                ];
                Ok(futures::stream::iter(items).boxed())
            })
        }
    }

    fn fast_policy() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn unavailable() -> PlaitError {
        PlaitError::LlmRequest("HTTP 503 Service Unavailable".into())
    }

    fn unauthorized() -> PlaitError {
        PlaitError::LlmRequest("HTTP 401 unauthorized".into())
    }

    fn refused() -> PlaitError {
        PlaitError::LlmRejected("ContentFilter".into())
    }

    async fn call(client: &RetryingClient) -> Result<()> {
        let mut stream = client
            .chat_stream(&ModelConfig::new("m"), vec![ChatMessage::user("hi")])
            .await?;
        assert!(matches!(stream.next().await, Some(Ok(StreamDelta::TextDelta(_)))));
        Ok(())
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let (primary, calls) = Flaky::new(2, unavailable);
        let client = RetryingClient::new(Box::new(primary), vec![], fast_policy());
        call(&client).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_goes_straight_to_fallback() {
        let (primary, primary_calls) = Flaky::new(usize::MAX, unauthorized);
        let (backup, backup_calls) = Flaky::new(0, unauthorized);
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(ModelConfig::new("backup"), Box::new(backup) as Box<dyn LlmClient>)],
            fast_policy(),
        );
        assert_eq!(client.fallback_count(), 1);
        call(&client).await.unwrap();
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refusal_skips_fallbacks() {
        let (primary, primary_calls) = Flaky::new(usize::MAX, refused);
        let (backup, backup_calls) = Flaky::new(0, refused);
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(ModelConfig::new("backup"), Box::new(backup) as Box<dyn LlmClient>)],
            fast_policy(),
        );
        let err = call(&client).await.unwrap_err();
        assert!(matches!(err, PlaitError::LlmRejected(_)));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_error_is_reported_when_everything_fails() {
        let (primary, _) = Flaky::new(usize::MAX, unavailable);
        let (backup, _) = Flaky::new(usize::MAX, unauthorized);
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(ModelConfig::new("backup"), Box::new(backup) as Box<dyn LlmClient>)],
            fast_policy(),
        );
        let err = call(&client).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        assert!(backoff(8, &policy) <= Duration::from_millis(4800));
        assert!(backoff(60, &policy) <= Duration::from_millis(4800));
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&PlaitError::LlmRequest("Connection reset".into())));
        assert!(is_transient(&PlaitError::LlmStream("eof".into())));
        assert!(!is_transient(&unauthorized()));
        assert!(!is_transient(&refused()));
    }
}
