pub mod providers;
pub mod retry;

use std::sync::Arc;

use sluice_core::config::ModelConfig;
use sluice_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new(config.clone())),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new(config.clone())),
    }
}

/// Provider client, wrapped in [`RetryingClient`] when `[model.retry]` is set.
pub fn build_client(config: &ModelConfig) -> Arc<dyn LlmClient> {
    let client = create_client(config);
    match &config.retry {
        Some(retry) => Arc::new(RetryingClient::new(client, retry.clone())),
        None => Arc::from(client),
    }
}
