use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput, ScriptInvocation};
use sluice_core::workflow::{NodeConfig, NodeType};

use super::wrong_config;

/// Hands a registered or inline script to the configured script runner.
pub struct PythonScriptExecutor;

fn fail(message: impl Into<String>) -> SluiceError {
    SluiceError::executor(NodeType::PythonScript.as_str(), message)
}

impl NodeExecutor for PythonScriptExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::PythonScript
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::PythonScript(config) = config else {
                return Err(wrong_config(NodeType::PythonScript, &config));
            };

            let code = match (&config.script_id, &config.code) {
                (Some(id), _) => ctx.services.registry()?.get_script(id).await?.code,
                (None, Some(code)) => code.clone(),
                (None, None) => return Err(fail("either scriptId or code is required")),
            };

            // Upstream keys that are absent are passed as null.
            let mut input = Map::new();
            for key in &config.input_keys {
                let value = ctx.data.get(&ctx.session_id, key).await?.unwrap_or(Value::Null);
                input.insert(key.clone(), value);
            }

            let invocation = ScriptInvocation {
                session_id: ctx.session_id.clone(),
                node_id: ctx.node_id.clone(),
                code,
                input: Value::Object(input),
                timeout_secs: config.timeout.unwrap_or(ctx.services.script_timeout_secs),
            };
            debug!(node_id = %ctx.node_id, timeout_secs = invocation.timeout_secs, "Running script");

            let outcome = ctx.services.scripts()?.run(invocation).await?;
            if outcome.success {
                Ok(NodeOutput::new(outcome.data))
            } else {
                let error = outcome.error.unwrap_or_else(|| "script failed without an error message".into());
                warn!(node_id = %ctx.node_id, error = %error, "Script failed");
                Err(fail(error))
            }
        })
    }
}
