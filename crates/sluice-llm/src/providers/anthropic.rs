use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sluice_core::config::ModelConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::LlmClient;
use sluice_core::types::{Completion, CompletionRequest};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// A requested output schema is appended to the system prompt as an instruction.
fn build_request(config: &ModelConfig, request: &CompletionRequest) -> AnthropicRequest {
    let system = match (&request.system, &request.schema) {
        (sys, Some(schema)) => Some(format!(
            "{}Respond with a single JSON value that validates against this JSON Schema:\n{}",
            sys.as_deref().map(|s| format!("{}\n\n", s)).unwrap_or_default(),
            schema
        )),
        (sys, None) => sys.clone(),
    };
    AnthropicRequest {
        model: config.model_id.clone(),
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        system,
        messages: vec![ApiMessage {
            role: "user",
            content: request.user.clone(),
        }],
    }
}

fn into_completion(resp: AnthropicResponse) -> Result<Completion> {
    let text: String = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        return Err(SluiceError::LlmParse("response has no text content".into()));
    }
    let (input_tokens, output_tokens) = resp
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));
    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

impl LlmClient for AnthropicClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| SluiceError::Config("Anthropic API key not set".into()))?;

            let base_url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let body = build_request(&self.config, &request);

            let response = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| SluiceError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(SluiceError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| SluiceError::LlmParse(e.to_string()))?;
            let completion = into_completion(parsed)?;
            debug!(model = %self.config.model_id, output_tokens = completion.output_tokens, "Anthropic completion received");
            Ok(completion)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ModelConfig {
        ModelConfig {
            provider: "anthropic".into(),
            model_id: "claude-sonnet-4-20250514".into(),
            api_key: Some("sk".into()),
            base_url: None,
            max_tokens: 2048,
            temperature: 0.2,
            retry: None,
        }
    }

    #[test]
    fn test_schema_goes_into_system_prompt() {
        let req = CompletionRequest {
            system: Some("Be brief.".into()),
            user: "score these".into(),
            schema: Some(json!({"type": "array"})),
        };
        let body = build_request(&config(), &req);
        let system = body.system.unwrap();
        assert!(system.starts_with("Be brief.\n\n"));
        assert!(system.contains("{\"type\":\"array\"}"));
        assert_eq!(body.temperature, Some(0.2));
    }

    #[test]
    fn test_text_blocks_joined() {
        let resp: AnthropicResponse = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "[1,"}, {"type": "text", "text": "2]"}],
            "usage": {"input_tokens": 5, "output_tokens": 2}
        }))
        .unwrap();
        let c = into_completion(resp).unwrap();
        assert_eq!(c.text, "[1,2]");
        assert_eq!(c.input_tokens, 5);
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let mut cfg = config();
        cfg.api_key = None;
        let client = AnthropicClient::new(cfg);
        let err = client.complete(CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }
}
