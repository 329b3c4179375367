use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resolver::has_placeholder;

/// A reusable pipeline definition: typed nodes connected by directed edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

fn default_active() -> bool {
    true
}

impl Workflow {
    /// Create an empty, active workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            active: true,
            nodes: vec![],
            edges: vec![],
        }
    }

    /// Append a node. The node's `order` is taken as given.
    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        let mut node = node;
        node.workflow_id = self.id.clone();
        self.nodes.push(node);
        self
    }

    /// Append an edge.
    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge::new(source, target));
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of the direct predecessors of `id`.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Ids of the direct successors of `id`.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .map(|e| e.target.as_str())
            .collect()
    }
}

/// A typed step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default)]
    pub workflow_id: String,
    pub name: String,
    /// Display order; only used to break ties between otherwise unordered nodes.
    #[serde(default)]
    pub order: i64,
    #[serde(flatten)]
    pub config: NodeConfig,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: i64, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            workflow_id: String::new(),
            name: name.into(),
            order,
            config,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

/// A dependency / data-flow edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// The closed set of node type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "dataSource")]
    DataSource,
    #[serde(rename = "transform")]
    Transform,
    #[serde(rename = "prompt")]
    Prompt,
    #[serde(rename = "api_call")]
    ApiCall,
    #[serde(rename = "json_processing")]
    JsonProcessing,
    #[serde(rename = "data_transformation")]
    DataTransformation,
    #[serde(rename = "sql_execution")]
    SqlExecution,
    #[serde(rename = "python_script")]
    PythonScript,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Start,
        NodeType::End,
        NodeType::DataSource,
        NodeType::Transform,
        NodeType::Prompt,
        NodeType::ApiCall,
        NodeType::JsonProcessing,
        NodeType::DataTransformation,
        NodeType::SqlExecution,
        NodeType::PythonScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::DataSource => "dataSource",
            Self::Transform => "transform",
            Self::Prompt => "prompt",
            Self::ApiCall => "api_call",
            Self::JsonProcessing => "json_processing",
            Self::DataTransformation => "data_transformation",
            Self::SqlExecution => "sql_execution",
            Self::PythonScript => "python_script",
        }
    }

    /// Start and end nodes only anchor the graph.
    pub fn is_anchor(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type node configuration.
///
/// Serialized adjacently tagged as `{"type": "<tag>", "config": {...}}`, flattened
/// into the surrounding [`WorkflowNode`]. Anchor nodes carry no config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum NodeConfig {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "dataSource")]
    DataSource(DataSourceConfig),
    #[serde(rename = "transform")]
    Transform(TransformConfig),
    #[serde(rename = "prompt")]
    Prompt(PromptConfig),
    #[serde(rename = "api_call")]
    ApiCall(ApiCallConfig),
    #[serde(rename = "json_processing")]
    JsonProcessing(ReshapeConfig),
    #[serde(rename = "data_transformation")]
    DataTransformation(ReshapeConfig),
    #[serde(rename = "sql_execution")]
    SqlExecution(SqlExecutionConfig),
    #[serde(rename = "python_script")]
    PythonScript(PythonScriptConfig),
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Start => NodeType::Start,
            Self::End => NodeType::End,
            Self::DataSource(_) => NodeType::DataSource,
            Self::Transform(_) => NodeType::Transform,
            Self::Prompt(_) => NodeType::Prompt,
            Self::ApiCall(_) => NodeType::ApiCall,
            Self::JsonProcessing(_) => NodeType::JsonProcessing,
            Self::DataTransformation(_) => NodeType::DataTransformation,
            Self::SqlExecution(_) => NodeType::SqlExecution,
            Self::PythonScript(_) => NodeType::PythonScript,
        }
    }

    /// The session key this node writes its output under, if any.
    pub fn output_key(&self) -> Option<&str> {
        match self {
            Self::Start | Self::End => None,
            Self::DataSource(c) => Some(&c.output_key),
            Self::Transform(c) => Some(&c.output_key),
            Self::Prompt(c) => Some(&c.output_key),
            Self::ApiCall(c) => Some(&c.output_key),
            Self::JsonProcessing(c) | Self::DataTransformation(c) => Some(&c.output_key),
            Self::SqlExecution(c) => c.output_key.as_deref(),
            Self::PythonScript(c) => Some(&c.output_key),
        }
    }

    /// Session keys the node reads directly (template placeholders not included).
    pub fn input_keys(&self) -> Vec<&str> {
        match self {
            Self::Transform(c) => vec![c.input_key.as_str()],
            Self::JsonProcessing(c) | Self::DataTransformation(c) => vec![c.input_key.as_str()],
            Self::Prompt(c) => c.variables.values().map(String::as_str).collect(),
            Self::PythonScript(c) => c.input_keys.iter().map(String::as_str).collect(),
            _ => vec![],
        }
    }

    /// Configuration problems that can be detected without running the node.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(key) = self.output_key() {
            if key.trim().is_empty() {
                problems.push("outputKey must not be empty".to_string());
            }
        }
        match self {
            Self::DataSource(c) => {
                if c.query.trim().is_empty() {
                    problems.push("query must not be empty".to_string());
                }
                if has_placeholder(&c.query) {
                    problems.push("query must not contain placeholders; pass values through params".to_string());
                }
            }
            Self::Transform(c) if c.input_key.trim().is_empty() => {
                problems.push("inputKey must not be empty".to_string());
            }
            Self::JsonProcessing(c) | Self::DataTransformation(c) => {
                if c.input_key.trim().is_empty() {
                    problems.push("inputKey must not be empty".to_string());
                }
                if c.steps.is_empty() {
                    problems.push("at least one step is required".to_string());
                }
            }
            Self::Prompt(c) if c.prompt_id.trim().is_empty() => {
                problems.push("promptId must not be empty".to_string());
            }
            Self::ApiCall(c) if c.api_id.is_none() && c.url.is_none() => {
                problems.push("either apiId or url is required".to_string());
            }
            Self::SqlExecution(c) => {
                if c.statement.trim().is_empty() {
                    problems.push("statement must not be empty".to_string());
                }
                if has_placeholder(&c.statement) {
                    problems.push("statement must not contain placeholders; pass values through params".to_string());
                }
            }
            Self::PythonScript(c) if c.script_id.is_none() && c.code.is_none() => {
                problems.push("either scriptId or code is required".to_string());
            }
            _ => {}
        }
        problems
    }
}

/// Where a `dataSource` node reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    #[default]
    Relational,
    Warehouse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    #[serde(default)]
    pub source: DataSourceKind,
    /// Query text; `{key}` placeholders are resolved before execution.
    pub query: String,
    /// Positional parameters, each resolved as a template.
    #[serde(default)]
    pub params: Vec<String>,
    pub output_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub input_key: String,
    pub output_key: String,
    pub operation: TransformOperation,
}

/// Named transform operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOperation {
    /// Serialize the input to a JSON string.
    ToJson,
    /// Parse a JSON string (code fences tolerated).
    JsonParse,
    /// Pull one field out of an object, or out of every object in an array.
    ExtractField { field: String },
    /// Group an array of objects by a field value.
    GroupBy { field: String },
    /// Shallow-merge an array of objects, later keys win.
    MergeObjects,
    /// Reduce an array (optionally a field of each element) to one number.
    Aggregate {
        #[serde(default)]
        field: Option<String>,
        function: AggregateFunction,
    },
    /// Flatten one level of nested arrays.
    Flatten,
    SortBy {
        field: String,
        #[serde(default)]
        descending: bool,
    },
    Limit { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Shared by `json_processing` and `data_transformation` nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReshapeConfig {
    pub input_key: String,
    pub output_key: String,
    pub steps: Vec<ReshapeStep>,
}

/// One structural reshaping step, applied in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReshapeStep {
    /// Descend into a path such as `choices[0].message.content`.
    Extract { path: String },
    /// Parse the current string value as JSON.
    ParseJson,
    /// Keep only the listed fields of an object (or of every object in an array).
    Select { fields: Vec<String> },
    Rename { from: String, to: String },
    /// Add `field` computed by aggregating the array found at path `from`.
    Derive {
        field: String,
        from: String,
        function: AggregateFunction,
    },
    Set {
        field: String,
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    pub prompt_id: String,
    /// Template variable name -> session data key.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub output_key: String,
    /// Write `{"raw": ..., "data": ...}` instead of only the parsed response.
    #[serde(default)]
    pub include_raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallConfig {
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry_count: u32,
    /// Delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    pub output_key: String,
}

fn default_api_timeout() -> u64 {
    30
}
fn default_retry_delay() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlExecutionConfig {
    pub statement: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonScriptConfig {
    #[serde(default)]
    pub script_id: Option<String>,
    /// Inline code, used when no `scriptId` is given.
    #[serde(default)]
    pub code: Option<String>,
    /// Session keys handed to the script as upstream data.
    #[serde(default)]
    pub input_keys: Vec<String>,
    pub output_key: String,
    /// Timeout in seconds; falls back to the sandbox default.
    #[serde(default)]
    pub timeout: Option<u64>,
}
