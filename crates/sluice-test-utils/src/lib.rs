//! Shared fakes for every Sluice port, plus workflow fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use sluice_core::config::ResolverMode;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::*;
use sluice_core::types::*;
use sluice_core::workflow::*;
use sluice_core::{SessionDataStore, VariableResolver};

// ── Persistence ─────────────────────────────────────────────────

#[derive(Default)]
struct MemState {
    workflows: HashMap<String, Workflow>,
    sessions: HashMap<SessionId, WorkflowSession>,
    data: Vec<SessionDataEntry>,
    ledger: Vec<NodeExecutionRecord>,
    prompts: HashMap<String, PromptTemplate>,
    apis: HashMap<String, ApiDefinition>,
    scripts: HashMap<String, ScriptDefinition>,
}

/// In-memory implementation of every repository port and the resource registry.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemState>,
    fail_ledger: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(self, prompt: PromptTemplate) -> Self {
        self.state.lock().unwrap().prompts.insert(prompt.id.clone(), prompt);
        self
    }

    pub fn with_api(self, api: ApiDefinition) -> Self {
        self.state.lock().unwrap().apis.insert(api.id.clone(), api);
        self
    }

    pub fn with_script(self, script: ScriptDefinition) -> Self {
        self.state.lock().unwrap().scripts.insert(script.id.clone(), script);
        self
    }

    pub fn with_workflow(self, workflow: Workflow) -> Self {
        self.state.lock().unwrap().workflows.insert(workflow.id.clone(), workflow);
        self
    }

    /// Make every subsequent ledger append fail with a `Store` error.
    pub fn fail_ledger_appends(&self, fail: bool) {
        self.fail_ledger.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all ledger records across sessions.
    pub fn ledger(&self) -> Vec<NodeExecutionRecord> {
        self.state.lock().unwrap().ledger.clone()
    }

    /// Insert a session row directly, bypassing the engine.
    pub fn insert_session(&self, session: WorkflowSession) {
        self.state.lock().unwrap().sessions.insert(session.id.clone(), session);
    }
}

impl WorkflowRepository for InMemoryStore {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let wf = self.state.lock().unwrap().workflows.get(id).cloned();
        Box::pin(async move { Ok(wf) })
    }

    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        self.state
            .lock()
            .unwrap()
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Box::pin(async { Ok(()) })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        let mut all: Vec<Workflow> = self.state.lock().unwrap().workflows.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Box::pin(async move { Ok(all) })
    }
}

impl SessionRepository for InMemoryStore {
    fn create_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>> {
        self.insert_session(session.clone());
        Box::pin(async { Ok(()) })
    }

    fn get_session(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let s = self.state.lock().unwrap().sessions.get(id).cloned();
        Box::pin(async move { Ok(s) })
    }

    fn update_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>> {
        let mut state = self.state.lock().unwrap();
        let result = match state.sessions.get_mut(&session.id) {
            Some(s) => {
                *s = session.clone();
                Ok(())
            }
            None => Err(SluiceError::SessionNotFound(session.id.to_string())),
        };
        Box::pin(async move { result })
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        let list: Vec<WorkflowSession> = self
            .state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        Box::pin(async move { Ok(list) })
    }
}

impl SessionDataRepository for InMemoryStore {
    fn upsert_entry(&self, entry: &SessionDataEntry) -> BoxFuture<'_, Result<()>> {
        let mut state = self.state.lock().unwrap();
        state
            .data
            .retain(|e| !(e.session_id == entry.session_id && e.key == entry.key));
        state.data.push(entry.clone());
        Box::pin(async { Ok(()) })
    }

    fn get_entry(&self, session: &SessionId, key: &str) -> BoxFuture<'_, Result<Option<SessionDataEntry>>> {
        let e = self
            .state
            .lock()
            .unwrap()
            .data
            .iter()
            .find(|e| &e.session_id == session && e.key == key)
            .cloned();
        Box::pin(async move { Ok(e) })
    }

    fn list_entries(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<SessionDataEntry>>> {
        let list: Vec<SessionDataEntry> = self
            .state
            .lock()
            .unwrap()
            .data
            .iter()
            .filter(|e| &e.session_id == session)
            .cloned()
            .collect();
        Box::pin(async move { Ok(list) })
    }
}

impl LedgerRepository for InMemoryStore {
    fn append(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<i64>> {
        if self.fail_ledger.load(Ordering::SeqCst) {
            return Box::pin(async { Err(SluiceError::Store("ledger unavailable".into())) });
        }
        let mut state = self.state.lock().unwrap();
        let seq = state.ledger.len() as i64 + 1;
        let mut record = record.clone();
        record.seq = seq;
        state.ledger.push(record);
        Box::pin(async move { Ok(seq) })
    }

    fn records(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<NodeExecutionRecord>>> {
        let list: Vec<NodeExecutionRecord> = self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|r| &r.session_id == session)
            .cloned()
            .collect();
        Box::pin(async move { Ok(list) })
    }
}

fn not_found(kind: &str, id: &str) -> SluiceError {
    SluiceError::ResourceNotFound {
        kind: kind.into(),
        id: id.into(),
    }
}

impl ResourceRegistry for InMemoryStore {
    fn get_prompt(&self, id: &str) -> BoxFuture<'_, Result<PromptTemplate>> {
        let p = self.state.lock().unwrap().prompts.get(id).cloned().ok_or_else(|| not_found("prompt", id));
        Box::pin(async move { p })
    }

    fn get_api(&self, id: &str) -> BoxFuture<'_, Result<ApiDefinition>> {
        let a = self.state.lock().unwrap().apis.get(id).cloned().ok_or_else(|| not_found("api", id));
        Box::pin(async move { a })
    }

    fn get_script(&self, id: &str) -> BoxFuture<'_, Result<ScriptDefinition>> {
        let s = self.state.lock().unwrap().scripts.get(id).cloned().ok_or_else(|| not_found("script", id));
        Box::pin(async move { s })
    }
}

// ── External services ───────────────────────────────────────────

/// Mock LLM that returns scripted responses in order and records requests.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: SluiceError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        self.requests.lock().unwrap().push(request);
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SluiceError::LlmRequest("no scripted response left".into())));
        Box::pin(async move {
            next.map(|text| Completion {
                text,
                ..Default::default()
            })
        })
    }
}

/// Relational or warehouse fake: answers every query with the same rows and
/// records each statement.
#[derive(Default)]
pub struct MockRelational {
    rows: Vec<Row>,
    affected: u64,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MockRelational {
    pub fn with_rows(rows: Value) -> Self {
        let rows = match rows {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(m) => Some(m),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        };
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    /// Every `(sql, params)` received, in order.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RelationalStore for MockRelational {
    fn query(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<Vec<Row>>> {
        self.calls.lock().unwrap().push((sql.to_string(), params));
        let rows = self.rows.clone();
        Box::pin(async move { Ok(rows) })
    }

    fn execute(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<u64>> {
        self.calls.lock().unwrap().push((sql.to_string(), params));
        let affected = self.affected;
        Box::pin(async move { Ok(affected) })
    }
}

impl WarehouseConnector for MockRelational {
    fn query(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<Vec<Row>>> {
        RelationalStore::query(self, sql, params)
    }
}

type ScriptFn = dyn Fn(&ScriptInvocation) -> Result<ScriptOutcome> + Send + Sync;

/// Script runner fake driven by a closure.
pub struct FakeScriptRunner {
    handler: Box<ScriptFn>,
    invocations: Mutex<Vec<ScriptInvocation>>,
}

impl FakeScriptRunner {
    pub fn new(handler: impl Fn(&ScriptInvocation) -> Result<ScriptOutcome> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            invocations: Mutex::new(vec![]),
        }
    }

    /// Always succeed with `data`.
    pub fn returning(data: Value) -> Self {
        Self::new(move |_| {
            Ok(ScriptOutcome {
                success: true,
                data: data.clone(),
                error: None,
            })
        })
    }

    pub fn invocations(&self) -> Vec<ScriptInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

impl ScriptRunner for FakeScriptRunner {
    fn run(&self, invocation: ScriptInvocation) -> BoxFuture<'_, Result<ScriptOutcome>> {
        let result = (self.handler)(&invocation);
        self.invocations.lock().unwrap().push(invocation);
        Box::pin(async move { result })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Build a `NodeContext` over an in-memory store for executor tests.
pub fn node_context(session: &str, node_id: &str, services: NodeServices) -> NodeContext {
    node_context_with_mode(session, node_id, services, ResolverMode::Permissive)
}

pub fn node_context_with_mode(
    session: &str,
    node_id: &str,
    services: NodeServices,
    mode: ResolverMode,
) -> NodeContext {
    let data = Arc::new(SessionDataStore::new(Arc::new(InMemoryStore::new())));
    NodeContext {
        session_id: SessionId::from_str(session),
        node_id: node_id.to_string(),
        resolver: Arc::new(VariableResolver::new(data.clone(), mode)),
        data,
        services,
    }
}

pub fn data_source_node(query: &str, output_key: &str) -> NodeConfig {
    NodeConfig::DataSource(DataSourceConfig {
        source: DataSourceKind::Relational,
        query: query.to_string(),
        params: vec![],
        output_key: output_key.to_string(),
    })
}

pub fn transform_node(input_key: &str, output_key: &str, operation: TransformOperation) -> NodeConfig {
    NodeConfig::Transform(TransformConfig {
        input_key: input_key.to_string(),
        output_key: output_key.to_string(),
        operation,
    })
}

/// `start -> nodes... -> end`, chained in the given order.
pub fn linear_workflow(id: &str, nodes: Vec<(&str, NodeConfig)>) -> Workflow {
    let mut wf = Workflow::new(id, format!("{} workflow", id))
        .with_node(WorkflowNode::new("start", "Start", 0, NodeConfig::Start));
    let mut prev = "start".to_string();
    for (i, (node_id, config)) in nodes.into_iter().enumerate() {
        wf = wf
            .with_node(WorkflowNode::new(node_id, node_id, i as i64 + 1, config))
            .with_edge(prev.clone(), node_id);
        prev = node_id.to_string();
    }
    let end_order = wf.nodes.len() as i64;
    wf.with_node(WorkflowNode::new("end", "End", end_order, NodeConfig::End))
        .with_edge(prev, "end")
}

/// Services wired to the given fakes.
pub fn services(
    store: Arc<InMemoryStore>,
    relational: Option<Arc<MockRelational>>,
    llm: Option<Arc<MockLlm>>,
    scripts: Option<Arc<FakeScriptRunner>>,
) -> NodeServices {
    NodeServices {
        registry: Some(store as Arc<dyn ResourceRegistry>),
        relational: relational.clone().map(|r| r as Arc<dyn RelationalStore>),
        warehouse: relational.map(|r| r as Arc<dyn WarehouseConnector>),
        llm: llm.map(|l| l as Arc<dyn LlmClient>),
        scripts: scripts.map(|s| s as Arc<dyn ScriptRunner>),
        script_timeout_secs: 5,
    }
}
