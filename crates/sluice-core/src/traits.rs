use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;
use crate::workflow::{NodeConfig, NodeType, Workflow};

/// A result row from a relational or warehouse query, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Registry of prompts, API definitions and scripts referenced by node configs.
pub trait ResourceRegistry: Send + Sync + 'static {
    fn get_prompt(&self, id: &str) -> BoxFuture<'_, Result<PromptTemplate>>;

    fn get_api(&self, id: &str) -> BoxFuture<'_, Result<ApiDefinition>>;

    fn get_script(&self, id: &str) -> BoxFuture<'_, Result<ScriptDefinition>>;
}

/// Executor for one node type.
pub trait NodeExecutor: Send + Sync + 'static {
    /// The type tag this executor handles.
    fn node_type(&self) -> NodeType;

    /// Run the node. The returned data is written under the node's output key
    /// by the caller.
    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>>;
}

/// Relational database used for reads and parameterized writes.
pub trait RelationalStore: Send + Sync + 'static {
    fn query(&self, sql: &str, params: Vec<serde_json::Value>) -> BoxFuture<'_, Result<Vec<Row>>>;

    /// Returns the number of affected rows.
    fn execute(&self, sql: &str, params: Vec<serde_json::Value>) -> BoxFuture<'_, Result<u64>>;
}

/// Read-only analytics warehouse.
pub trait WarehouseConnector: Send + Sync + 'static {
    fn query(&self, sql: &str, params: Vec<serde_json::Value>) -> BoxFuture<'_, Result<Vec<Row>>>;
}

/// LLM client, single-shot completion.
pub trait LlmClient: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>>;
}

/// Runs a script in an isolated working directory.
pub trait ScriptRunner: Send + Sync + 'static {
    fn run(&self, invocation: ScriptInvocation) -> BoxFuture<'_, Result<ScriptOutcome>>;
}

/// Workflow definitions, read-only to the engine.
pub trait WorkflowRepository: Send + Sync + 'static {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>>;

    /// Insert or replace a workflow definition.
    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>>;
}

/// Session rows and their status transitions.
pub trait SessionRepository: Send + Sync + 'static {
    fn create_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>>;

    fn get_session(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<WorkflowSession>>>;

    /// Overwrite status, timestamps and error of an existing session.
    fn update_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>>;

    fn list_sessions_by_status(&self, status: SessionStatus) -> BoxFuture<'_, Result<Vec<WorkflowSession>>>;
}

/// Durable backing for the session data store.
pub trait SessionDataRepository: Send + Sync + 'static {
    /// Insert or replace the entry for `(session_id, key)`.
    fn upsert_entry(&self, entry: &SessionDataEntry) -> BoxFuture<'_, Result<()>>;

    fn get_entry(&self, session: &SessionId, key: &str) -> BoxFuture<'_, Result<Option<SessionDataEntry>>>;

    /// All entries of a session, ordered by write time then key.
    fn list_entries(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<SessionDataEntry>>>;
}

/// Append-only node execution ledger.
pub trait LedgerRepository: Send + Sync + 'static {
    /// Append a record; returns the assigned sequence number.
    fn append(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<i64>>;

    /// Records of a session in append order.
    fn records(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<NodeExecutionRecord>>>;
}
