use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::SessionDataStore;
use crate::error::SluiceError;
use crate::resolver::VariableResolver;
use crate::traits::{LlmClient, RelationalStore, ResourceRegistry, ScriptRunner, WarehouseConnector};

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a workflow session.
///
/// `pending -> running -> {completed | failed | cancelled}`; terminal states are final.
/// A pending session may also be cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SluiceError::Store(format!("unknown session status: {}", other))),
        }
    }
}

/// One run of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: SessionId,
    pub workflow_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub created_by: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason for `failed` sessions.
    pub error: Option<String>,
}

impl WorkflowSession {
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            workflow_id: workflow_id.into(),
            name: name.into(),
            status: SessionStatus::Pending,
            created_by: created_by.into(),
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Declared kind of a stored session value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Object,
    Array,
    String,
    Number,
    Boolean,
    Null,
}

impl ValueKind {
    pub fn of(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Null => Self::Null,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }
}

impl FromStr for ValueKind {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "null" => Ok(Self::Null),
            other => Err(SluiceError::Store(format!("unknown value kind: {}", other))),
        }
    }
}

/// A value written under a key in a session's data space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDataEntry {
    pub session_id: SessionId,
    pub key: String,
    pub value: serde_json::Value,
    pub kind: ValueKind,
    pub producer_node_id: String,
    pub written_at: DateTime<Utc>,
}

/// Status of one node invocation in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SluiceError::Store(format!("unknown node status: {}", other))),
        }
    }
}

/// One ledger row. A node contributes a `running` row and then one terminal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    /// Insertion sequence, assigned by the repository.
    #[serde(default)]
    pub seq: i64,
    pub session_id: SessionId,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// What an executor hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub data: serde_json::Value,
    /// Overrides the kind derived from `data`.
    pub kind: Option<ValueKind>,
}

impl NodeOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, kind: None }
    }

    pub fn empty() -> Self {
        Self::new(serde_json::Value::Null)
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// A registered prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system: Option<String>,
    /// User message template with `{variable}` placeholders.
    pub template: String,
    /// JSON Schema the model response must satisfy.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

/// A registered outbound HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A registered script body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub id: String,
    pub name: String,
    pub code: String,
}

/// Request to the language model service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    /// When set, the provider is asked for JSON matching this schema.
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Input handed to a sandboxed script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptInvocation {
    pub session_id: SessionId,
    pub node_id: String,
    pub code: String,
    /// Upstream data keyed by session key.
    pub input: serde_json::Value,
    pub timeout_secs: u64,
}

/// The `{success, data, error?}` envelope printed by the script wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// External collaborators available to node executors.
///
/// Every port is optional; an executor that needs a missing one fails with a
/// `Config` error.
#[derive(Clone, Default)]
pub struct NodeServices {
    pub registry: Option<Arc<dyn ResourceRegistry>>,
    pub relational: Option<Arc<dyn RelationalStore>>,
    pub warehouse: Option<Arc<dyn WarehouseConnector>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub scripts: Option<Arc<dyn ScriptRunner>>,
    /// Script timeout used when a node does not set its own.
    pub script_timeout_secs: u64,
}

fn missing(port: &str) -> SluiceError {
    SluiceError::Config(format!("no {} configured", port))
}

impl NodeServices {
    pub fn registry(&self) -> Result<&Arc<dyn ResourceRegistry>, SluiceError> {
        self.registry.as_ref().ok_or_else(|| missing("resource registry"))
    }

    pub fn relational(&self) -> Result<&Arc<dyn RelationalStore>, SluiceError> {
        self.relational.as_ref().ok_or_else(|| missing("relational store"))
    }

    pub fn warehouse(&self) -> Result<&Arc<dyn WarehouseConnector>, SluiceError> {
        self.warehouse.as_ref().ok_or_else(|| missing("warehouse connector"))
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmClient>, SluiceError> {
        self.llm.as_ref().ok_or_else(|| missing("LLM client"))
    }

    pub fn scripts(&self) -> Result<&Arc<dyn ScriptRunner>, SluiceError> {
        self.scripts.as_ref().ok_or_else(|| missing("script runner"))
    }
}

impl std::fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServices")
            .field("registry", &self.registry.is_some())
            .field("relational", &self.relational.is_some())
            .field("warehouse", &self.warehouse.is_some())
            .field("llm", &self.llm.is_some())
            .field("scripts", &self.scripts.is_some())
            .field("script_timeout_secs", &self.script_timeout_secs)
            .finish()
    }
}

/// Context passed to node executors.
#[derive(Clone)]
pub struct NodeContext {
    pub session_id: SessionId,
    pub node_id: String,
    pub data: Arc<SessionDataStore>,
    pub resolver: Arc<VariableResolver>,
    pub services: NodeServices,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("session_id", &self.session_id)
            .field("node_id", &self.node_id)
            .field("services", &self.services)
            .finish()
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionStarted {
        session_id: SessionId,
        workflow_id: String,
    },
    NodeStarted {
        session_id: SessionId,
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        session_id: SessionId,
        node_id: String,
        duration_ms: u64,
        output: serde_json::Value,
    },
    NodeFailed {
        session_id: SessionId,
        node_id: String,
        duration_ms: u64,
        error: String,
    },
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::NodeStarted { session_id, .. }
            | Self::NodeCompleted { session_id, .. }
            | Self::NodeFailed { session_id, .. }
            | Self::SessionFinished { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(Cancelled.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_value_kind_of() {
        assert_eq!(ValueKind::of(&json!({"a": 1})), ValueKind::Object);
        assert_eq!(ValueKind::of(&json!([1])), ValueKind::Array);
        assert_eq!(ValueKind::of(&json!("x")), ValueKind::String);
        assert_eq!(ValueKind::of(&json!(1.5)), ValueKind::Number);
        assert_eq!(ValueKind::of(&json!(false)), ValueKind::Boolean);
        assert_eq!(ValueKind::of(&json!(null)), ValueKind::Null);
        assert_eq!("array".parse::<ValueKind>().unwrap(), ValueKind::Array);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for s in ["pending", "running", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<SessionStatus>().unwrap().as_str(), s);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }
}
