use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{CompletionRequest, NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType};

use super::{strip_code_fences, wrong_config};

/// Renders a registered prompt template and calls the LLM service.
///
/// When the template declares an output schema the response must be JSON
/// that validates against it; otherwise the raw text is the node output.
pub struct PromptExecutor;

fn fail(message: impl Into<String>) -> SluiceError {
    SluiceError::executor(NodeType::Prompt.as_str(), message)
}

/// Parse `text` as JSON and validate it against `schema`.
pub(crate) fn parse_structured(text: &str, schema: &Value) -> Result<Value> {
    let value: Value = serde_json::from_str(&strip_code_fences(text))
        .map_err(|e| fail(format!("response is not valid JSON: {}", e)))?;

    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| fail(format!("invalid output schema: {}", e)))?;

    // Collect while `compiled` is alive; the error iterator borrows it.
    let messages = match compiled.validate(&value) {
        Ok(()) => None,
        Err(errors) => Some(
            errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect::<Vec<String>>(),
        ),
    };

    match messages {
        Some(messages) => Err(fail(format!(
            "response does not match output schema: {}",
            messages.join("; ")
        ))),
        None => Ok(value),
    }
}

impl NodeExecutor for PromptExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Prompt
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::Prompt(config) = config else {
                return Err(wrong_config(NodeType::Prompt, &config));
            };

            let template = ctx.services.registry()?.get_prompt(&config.prompt_id).await?;
            let user = ctx
                .resolver
                .resolve_with_aliases(&template.template, &ctx.session_id, &config.variables)
                .await?;
            let system = match &template.system {
                Some(s) => Some(
                    ctx.resolver
                        .resolve_with_aliases(s, &ctx.session_id, &config.variables)
                        .await?,
                ),
                None => None,
            };

            let request = CompletionRequest {
                system,
                user,
                schema: template.output_schema.clone(),
            };
            let completion = ctx.services.llm()?.complete(request).await?;
            debug!(
                node_id = %ctx.node_id,
                prompt_id = %config.prompt_id,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                "Prompt completed"
            );

            let data = match &template.output_schema {
                Some(schema) => parse_structured(&completion.text, schema).map_err(|e| {
                    warn!(node_id = %ctx.node_id, prompt_id = %config.prompt_id, error = %e, "Structured response rejected");
                    e
                })?,
                None => Value::String(completion.text.clone()),
            };

            if config.include_raw {
                Ok(NodeOutput::new(json!({ "raw": completion.text, "data": data })))
            } else {
                Ok(NodeOutput::new(data))
            }
        })
    }
}
