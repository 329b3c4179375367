use futures::future::BoxFuture;

use sluice_core::error::Result;
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType};

/// `start` and `end` nodes. They do nothing and produce no data.
pub struct AnchorExecutor {
    node_type: NodeType,
}

impl AnchorExecutor {
    pub fn start() -> Self {
        Self {
            node_type: NodeType::Start,
        }
    }

    pub fn end() -> Self {
        Self {
            node_type: NodeType::End,
        }
    }
}

impl NodeExecutor for AnchorExecutor {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn execute(&self, _ctx: NodeContext, _config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async { Ok(NodeOutput::empty()) })
    }
}
