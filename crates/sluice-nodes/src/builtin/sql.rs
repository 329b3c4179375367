use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use sluice_core::error::Result;
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType};

use super::data_source::resolve_params;
use super::wrong_config;

/// Parameterized write against the relational store.
pub struct SqlExecutionExecutor;

impl NodeExecutor for SqlExecutionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::SqlExecution
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::SqlExecution(config) = config else {
                return Err(wrong_config(NodeType::SqlExecution, &config));
            };
            let params = resolve_params(&ctx.resolver, &config.params, &ctx.session_id).await?;
            let affected = ctx.services.relational()?.execute(&config.statement, params).await?;
            debug!(node_id = %ctx.node_id, affected, "Statement executed");
            Ok(NodeOutput::new(json!({ "affected": affected })))
        })
    }
}
