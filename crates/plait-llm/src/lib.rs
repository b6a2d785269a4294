pub mod retry;

use plait_core::config::AppConfig;
use plait_core::traits::LlmClient;

pub use retry::RetryingClient;

/// Wrap a client with retries and the configured fallback models.
///
/// Returns the client unchanged when the model has no retry section and no
/// fallbacks are configured.
pub fn with_retry(
    primary: Box<dyn LlmClient>,
    config: &AppConfig,
    fallbacks: Vec<Box<dyn LlmClient>>,
) -> Box<dyn LlmClient> {
    if config.model.retry.is_none() && fallbacks.is_empty() {
        return primary;
    }
    let fallbacks = config
        .fallback_models
        .iter()
        .cloned()
        .zip(fallbacks)
        .collect();
    Box::new(RetryingClient::new(
        primary,
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    ))
}
