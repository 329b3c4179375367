use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType};

use crate::builtin;

/// Dispatch table from node type tag to executor.
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any executor for the same type.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.node_type(), executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    /// Registered type tags, sorted.
    pub fn list(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.executors.keys().copied().collect();
        types.sort();
        types
    }

    /// Execute a node with the executor registered for its type.
    pub async fn execute(&self, ctx: NodeContext, config: NodeConfig) -> Result<NodeOutput> {
        let node_type = config.node_type();
        let executor = self
            .get(node_type)
            .ok_or_else(|| SluiceError::UnknownNodeType(node_type.to_string()))?;
        debug!(session_id = %ctx.session_id, node_id = %ctx.node_id, node_type = %node_type, "Dispatching node");
        executor.execute(ctx, config).await
    }

    /// Create a registry with every built-in executor registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Anchors ─────────────────────────────────────────────
        registry.register(builtin::anchor::AnchorExecutor::start());
        registry.register(builtin::anchor::AnchorExecutor::end());

        // ── Data in / out ───────────────────────────────────────
        registry.register(builtin::data_source::DataSourceExecutor);
        registry.register(builtin::sql::SqlExecutionExecutor);
        registry.register(builtin::api_call::ApiCallExecutor::new());

        // ── Reshaping ───────────────────────────────────────────
        registry.register(builtin::transform::TransformExecutor);
        registry.register(builtin::reshape::ReshapeExecutor::json_processing());
        registry.register(builtin::reshape::ReshapeExecutor::data_transformation());

        // ── Model and scripts ───────────────────────────────────
        registry.register(builtin::prompt::PromptExecutor);
        registry.register(builtin::python_script::PythonScriptExecutor);

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use sluice_test_utils::{node_context, transform_node};
    use sluice_core::types::NodeServices;
    use sluice_core::workflow::TransformOperation;

    struct FixedTransform;

    impl NodeExecutor for FixedTransform {
        fn node_type(&self) -> NodeType {
            NodeType::Transform
        }

        fn execute(&self, _ctx: NodeContext, _config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
            Box::pin(async { Ok(NodeOutput::new(json!("overridden"))) })
        }
    }

    #[test]
    fn test_builtins_cover_every_type() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.list(), {
            let mut all = NodeType::ALL.to_vec();
            all.sort();
            all
        });
    }

    #[tokio::test]
    async fn test_missing_executor() {
        let registry = ExecutorRegistry::new();
        let ctx = node_context("s1", "n1", NodeServices::default());
        let err = registry.execute(ctx, NodeConfig::Start).await.unwrap_err();
        assert!(matches!(err, SluiceError::UnknownNodeType(t) if t == "start"));
    }

    #[tokio::test]
    async fn test_register_overrides_builtin() {
        let mut registry = ExecutorRegistry::with_builtins();
        registry.register(FixedTransform);
        let ctx = node_context("s1", "t", NodeServices::default());
        let out = registry
            .execute(ctx, transform_node("in", "out", TransformOperation::Flatten))
            .await
            .unwrap();
        assert_eq!(out.data, json!("overridden"));
    }
}
