use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use sluice_core::config::ModelConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::LlmClient;
use sluice_core::types::{Completion, CompletionRequest};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_request(config: &ModelConfig, request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(OaiMessage {
            role: "system",
            content: system.clone(),
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: request.user.clone(),
    });

    let response_format = request.schema.as_ref().map(|schema| {
        json!({
            "type": "json_schema",
            "json_schema": { "name": "node_output", "schema": schema }
        })
    });

    ChatRequest {
        model: config.model_id.clone(),
        messages,
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        response_format,
    }
}

fn into_completion(resp: ChatResponse) -> Result<Completion> {
    let text = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| SluiceError::LlmParse("response has no message content".into()))?;
    let (input_tokens, output_tokens) = resp
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));
    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

impl LlmClient for OpenAiClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let base_url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&self.config, &request);

            let mut req = self.http.post(base_url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
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

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| SluiceError::LlmParse(e.to_string()))?;
            let completion = into_completion(parsed)?;
            debug!(
                model = %self.config.model_id,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                "OpenAI completion received"
            );
            Ok(completion)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: None,
            base_url: None,
            max_tokens: 1024,
            temperature: 0.0,
            retry: None,
        }
    }

    #[test]
    fn test_request_with_schema() {
        let req = CompletionRequest {
            system: Some("sys".into()),
            user: "hello".into(),
            schema: Some(json!({"type": "object"})),
        };
        let body = serde_json::to_value(build_request(&config(), &req)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_plain_request() {
        let req = CompletionRequest {
            system: None,
            user: "hi".into(),
            schema: None,
        };
        let body = serde_json::to_value(build_request(&config(), &req)).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_into_completion() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3}
        }))
        .unwrap();
        let c = into_completion(resp).unwrap();
        assert_eq!(c.text, "{\"ok\":true}");
        assert_eq!(c.output_tokens, 3);

        let empty: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(into_completion(empty), Err(SluiceError::LlmParse(_))));
    }
}
