use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::config::{EngineConfig, ExecutionMode};
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::traits::{LedgerRepository, SessionDataRepository, SessionRepository, WorkflowRepository};
use sluice_core::types::{
    EngineEvent, NodeContext, NodeExecutionRecord, NodeServices, SessionDataEntry, SessionId, SessionStatus,
    WorkflowSession,
};
use sluice_core::validation::{validate, ValidationReport};
use sluice_core::workflow::{Workflow, WorkflowNode};
use sluice_core::{SessionDataStore, VariableResolver};
use sluice_nodes::ExecutorRegistry;

use crate::ledger::ExecutionLedger;
use crate::run_log::RunLogger;
use crate::schedule::{topological_order, ReadyQueue};
use crate::session::SessionManager;

/// How a single node invocation ended, when the engine itself stayed healthy.
#[derive(Debug, Clone, PartialEq)]
enum NodeOutcome {
    Completed,
    Failed(String),
}

/// Final status of a session run plus its failure reason.
type RunOutcome = (SessionStatus, Option<String>);

struct ActiveRun {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<SessionStatus>>>,
}

impl ActiveRun {
    fn is_live(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// Text carried by a panic payload, when it has any.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    workflows: Option<Arc<dyn WorkflowRepository>>,
    sessions: Option<Arc<dyn SessionRepository>>,
    data: Option<Arc<dyn SessionDataRepository>>,
    ledger: Option<Arc<dyn LedgerRepository>>,
    executors: Option<ExecutorRegistry>,
    services: NodeServices,
    config: EngineConfig,
    events: Option<Arc<EventBus>>,
    run_log: Option<(PathBuf, u8)>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            workflows: None,
            sessions: None,
            data: None,
            ledger: None,
            executors: None,
            services: NodeServices::default(),
            config: EngineConfig::default(),
            events: None,
            run_log: None,
        }
    }

    /// Use one store for every repository port.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: WorkflowRepository + SessionRepository + SessionDataRepository + LedgerRepository,
    {
        self.workflows(store.clone())
            .sessions(store.clone())
            .data(store.clone())
            .ledger(store)
    }

    pub fn workflows(mut self, repo: Arc<dyn WorkflowRepository>) -> Self {
        self.workflows = Some(repo);
        self
    }

    pub fn sessions(mut self, repo: Arc<dyn SessionRepository>) -> Self {
        self.sessions = Some(repo);
        self
    }

    pub fn data(mut self, repo: Arc<dyn SessionDataRepository>) -> Self {
        self.data = Some(repo);
        self
    }

    pub fn ledger(mut self, repo: Arc<dyn LedgerRepository>) -> Self {
        self.ledger = Some(repo);
        self
    }

    /// Executors to dispatch to. Defaults to the built-ins.
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn services(mut self, services: NodeServices) -> Self {
        self.services = services;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Write a JSONL run log per session under `log_dir`.
    pub fn run_log(mut self, log_dir: PathBuf, level: u8) -> Self {
        self.run_log = Some((log_dir, level));
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        fn required<T>(port: Option<T>, name: &str) -> Result<T> {
            port.ok_or_else(|| SluiceError::Config(format!("orchestrator needs a {} repository", name)))
        }

        let data = Arc::new(SessionDataStore::new(required(self.data, "session data")?));
        let resolver = Arc::new(VariableResolver::new(data.clone(), self.config.resolver));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_capacity)));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                workflows: required(self.workflows, "workflow")?,
                sessions: SessionManager::new(required(self.sessions, "session")?),
                ledger: ExecutionLedger::new(required(self.ledger, "ledger")?),
                data,
                resolver,
                executors: self.executors.unwrap_or_else(ExecutorRegistry::with_builtins),
                services: self.services,
                config: self.config,
                events,
                run_log: self.run_log,
                shutdown: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs workflow sessions.
///
/// Each session runs on its own tokio task. Nodes execute in dependency
/// order; a node failure stops dispatch and fails the session, while store
/// failures abort the session task and surface from [`Orchestrator::wait`].
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    workflows: Arc<dyn WorkflowRepository>,
    sessions: SessionManager,
    ledger: ExecutionLedger,
    data: Arc<SessionDataStore>,
    resolver: Arc<VariableResolver>,
    executors: ExecutorRegistry,
    services: NodeServices,
    config: EngineConfig,
    events: Arc<EventBus>,
    run_log: Option<(PathBuf, u8)>,
    shutdown: CancellationToken,
    active: Mutex<HashMap<SessionId, ActiveRun>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    /// Validate and store a workflow definition.
    ///
    /// Returns the report (possibly with warnings) when the workflow is valid.
    pub async fn register_workflow(&self, workflow: &Workflow) -> Result<ValidationReport> {
        let report = validate(workflow);
        if !report.is_valid() {
            return Err(SluiceError::Validation(report));
        }
        self.inner.workflows.save_workflow(workflow).await?;
        info!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "Workflow registered");
        Ok(report)
    }

    pub async fn start_session(&self, workflow_id: &str, name: &str, created_by: &str) -> Result<WorkflowSession> {
        self.start_session_with(workflow_id, name, created_by, json!({})).await
    }

    /// Create a session for a workflow and spawn its run.
    ///
    /// Invalid or inactive workflows are rejected before any session row is
    /// written. The returned session is the `pending` snapshot.
    pub async fn start_session_with(
        &self,
        workflow_id: &str,
        name: &str,
        created_by: &str,
        metadata: Value,
    ) -> Result<WorkflowSession> {
        let inner = &self.inner;
        let workflow = inner
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| SluiceError::WorkflowNotFound(workflow_id.to_string()))?;
        if !workflow.active {
            return Err(SluiceError::WorkflowInactive(workflow_id.to_string()));
        }

        let report = validate(&workflow);
        if !report.is_valid() {
            return Err(SluiceError::Validation(report));
        }
        for warning in &report.warnings {
            warn!(workflow_id, warning = %warning, "Workflow validation warning");
        }
        let order = topological_order(&workflow)?;

        let session = inner.sessions.create(workflow_id, name, created_by, metadata).await?;
        let cancel = inner.shutdown.child_token();

        if let Some((dir, level)) = &inner.run_log {
            RunLogger::new(dir.clone(), *level).spawn(&inner.events, session.id.clone(), inner.shutdown.child_token());
        }

        let task = inner
            .clone()
            .execute(session.id.clone(), Arc::new(workflow), order, cancel.clone());
        let handle = tokio::spawn(task);
        let mut active = self.lock_active();
        // Runs nobody waits for are dropped once their task has finished.
        active.retain(|_, run| run.is_live());
        active.insert(
            session.id.clone(),
            ActiveRun {
                cancel,
                handle: Some(handle),
            },
        );
        Ok(session)
    }

    /// Wait for a session started by this orchestrator to finish.
    ///
    /// Returns the final session row, or the fatal error that aborted the run.
    pub async fn wait(&self, id: &SessionId) -> Result<WorkflowSession> {
        let handle = self.lock_active().get_mut(id).and_then(|run| run.handle.take());
        if let Some(handle) = handle {
            let joined = handle.await;
            self.lock_active().remove(id);
            joined.map_err(|e| SluiceError::Store(format!("session task aborted: {}", e)))??;
        }
        self.inner.sessions.get(id).await
    }

    /// Start a session and wait for it to finish.
    pub async fn run_session(&self, workflow_id: &str, name: &str, created_by: &str) -> Result<WorkflowSession> {
        let session = self.start_session(workflow_id, name, created_by).await?;
        self.wait(&session.id).await
    }

    pub async fn get_session_status(&self, id: &SessionId) -> Result<WorkflowSession> {
        self.inner.sessions.get(id).await
    }

    pub async fn list_node_executions(&self, id: &SessionId) -> Result<Vec<NodeExecutionRecord>> {
        self.inner.sessions.get(id).await?;
        self.inner.ledger.records_for_session(id).await
    }

    pub async fn session_data(&self, id: &SessionId) -> Result<Vec<SessionDataEntry>> {
        self.inner.sessions.get(id).await?;
        self.inner.data.all(id).await
    }

    /// Request cancellation. A session running here stops before its next
    /// node; one with no live task is marked `cancelled` directly.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<()> {
        let session = self.inner.sessions.get(id).await?;
        if session.status.is_terminal() {
            return Err(SluiceError::InvalidTransition {
                from: session.status.to_string(),
                to: SessionStatus::Cancelled.to_string(),
            });
        }

        let token = self
            .lock_active()
            .get(id)
            .filter(|run| run.is_live())
            .map(|run| run.cancel.clone());
        match token {
            Some(token) => {
                info!(session_id = %id, "Cancellation requested");
                token.cancel();
            }
            None => {
                self.inner.sessions.transition(id, SessionStatus::Cancelled, None).await?;
                self.inner.events.publish(EngineEvent::SessionFinished {
                    session_id: id.clone(),
                    status: SessionStatus::Cancelled,
                    error: None,
                });
            }
        }
        Ok(())
    }

    /// Fail sessions left `pending` or `running` by a process that is gone.
    pub async fn recover(&self) -> Result<Vec<SessionId>> {
        let mut recovered = Vec::new();
        for status in [SessionStatus::Running, SessionStatus::Pending] {
            for session in self.inner.sessions.list_by_status(status).await? {
                if self.lock_active().contains_key(&session.id) {
                    continue;
                }
                self.inner
                    .sessions
                    .transition(
                        &session.id,
                        SessionStatus::Failed,
                        Some("interrupted: engine stopped before the session finished".into()),
                    )
                    .await?;
                warn!(session_id = %session.id, previous = %status, "Recovered interrupted session");
                recovered.push(session.id);
            }
        }
        Ok(recovered)
    }

    /// Cancel every live session and stop run loggers.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ActiveRun>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    async fn execute(
        self: Arc<Self>,
        session_id: SessionId,
        workflow: Arc<Workflow>,
        order: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<SessionStatus> {
        let outcome = self.drive(&session_id, workflow, order, &cancel).await;
        self.data.release(&session_id);

        let (mut status, mut reason, fatal) = match outcome {
            Ok((status, reason)) => (status, reason, None),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session aborted");
                (SessionStatus::Failed, Some(e.to_string()), Some(e))
            }
        };

        let finished = match self.sessions.transition(&session_id, status, reason.clone()).await {
            Err(SluiceError::InvalidTransition { from, to }) => match self.sessions.get(&session_id).await {
                Ok(row) if row.status == SessionStatus::Cancelled => {
                    info!(session_id = %session_id, outcome = %status, "Session was cancelled by another engine");
                    status = SessionStatus::Cancelled;
                    reason = None;
                    Ok(row)
                }
                _ => Err(SluiceError::InvalidTransition { from, to }),
            },
            other => other,
        };
        self.events.publish(EngineEvent::SessionFinished {
            session_id: session_id.clone(),
            status,
            error: reason,
        });

        if let Some(e) = fatal {
            if let Err(te) = finished {
                warn!(session_id = %session_id, error = %te, "Could not mark aborted session failed");
            }
            return Err(e);
        }
        finished?;
        info!(session_id = %session_id, status = %status, "Session finished");
        Ok(status)
    }

    async fn drive(
        self: &Arc<Self>,
        session_id: &SessionId,
        workflow: Arc<Workflow>,
        order: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        if self.cancel_requested(session_id, cancel).await? {
            return Ok((SessionStatus::Cancelled, None));
        }
        self.sessions.transition(session_id, SessionStatus::Running, None).await?;
        self.events.publish(EngineEvent::SessionStarted {
            session_id: session_id.clone(),
            workflow_id: workflow.id.clone(),
        });
        info!(session_id = %session_id, workflow_id = %workflow.id, mode = ?self.config.execution, "Session started");

        match self.config.execution {
            ExecutionMode::Sequential => self.run_sequential(session_id, &workflow, &order, cancel).await,
            ExecutionMode::Parallel => self.run_parallel(session_id, workflow, cancel).await,
        }
    }

    async fn run_sequential(
        &self,
        session_id: &SessionId,
        workflow: &Workflow,
        order: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        for node_id in order {
            if self.cancel_requested(session_id, cancel).await? {
                info!(session_id = %session_id, next_node = %node_id, "Session cancelled");
                return Ok((SessionStatus::Cancelled, None));
            }
            let Some(node) = workflow.node(node_id) else {
                continue;
            };
            if let NodeOutcome::Failed(error) = self.run_node(session_id, workflow, node).await? {
                return Ok((SessionStatus::Failed, Some(format!("node {} failed: {}", node.id, error))));
            }
        }
        Ok((SessionStatus::Completed, None))
    }

    async fn run_parallel(
        self: &Arc<Self>,
        session_id: &SessionId,
        workflow: Arc<Workflow>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut queue = ReadyQueue::new(&workflow);
        let mut in_flight: JoinSet<(String, Result<NodeOutcome>)> = JoinSet::new();
        let mut failure: Option<String> = None;
        let mut fatal: Option<SluiceError> = None;
        let limit = self.config.max_parallel.max(1);

        loop {
            let mut dispatch = failure.is_none() && fatal.is_none();
            if dispatch {
                match self.cancel_requested(session_id, cancel).await {
                    Ok(cancelled) => dispatch = !cancelled,
                    Err(e) => {
                        fatal = Some(e);
                        dispatch = false;
                    }
                }
            }
            while dispatch && in_flight.len() < limit {
                let Some(node_id) = queue.pop() else {
                    break;
                };
                let inner = self.clone();
                let wf = workflow.clone();
                let sid = session_id.clone();
                debug!(session_id = %sid, node_id = %node_id, in_flight = in_flight.len(), "Dispatching node");
                in_flight.spawn(async move {
                    let result = match wf.node(&node_id) {
                        Some(node) => inner.run_node(&sid, &wf, node).await,
                        None => Ok(NodeOutcome::Completed),
                    };
                    (node_id, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((node_id, Ok(NodeOutcome::Completed))) => queue.complete(&node_id),
                Ok((node_id, Ok(NodeOutcome::Failed(e)))) => {
                    failure.get_or_insert(format!("node {} failed: {}", node_id, e));
                }
                Ok((_, Err(e))) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(format!("node task panicked: {}", e));
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if let Some(reason) = failure {
            return Ok((SessionStatus::Failed, Some(reason)));
        }
        if !queue.remaining().is_empty() {
            info!(session_id = %session_id, skipped = queue.remaining().len(), "Session cancelled");
            return Ok((SessionStatus::Cancelled, None));
        }
        Ok((SessionStatus::Completed, None))
    }

    /// The local token fired, or the session row was cancelled through
    /// another engine sharing the store.
    async fn cancel_requested(&self, session_id: &SessionId, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        let row = self.sessions.get(session_id).await?;
        Ok(row.status == SessionStatus::Cancelled)
    }

    /// Config plus the current values of the keys the node reads directly.
    async fn input_snapshot(&self, session_id: &SessionId, node: &WorkflowNode) -> Result<Value> {
        let mut inputs = Map::new();
        for key in node.config.input_keys() {
            if let Some(value) = self.data.get(session_id, key).await? {
                inputs.insert(key.to_string(), value);
            }
        }
        Ok(json!({
            "config": serde_json::to_value(&node.config).unwrap_or_default(),
            "inputs": inputs,
        }))
    }

    /// Run one node and record it. `Err` means the engine itself failed.
    async fn run_node(&self, session_id: &SessionId, workflow: &Workflow, node: &WorkflowNode) -> Result<NodeOutcome> {
        let started_at = Utc::now();
        let input = self.input_snapshot(session_id, node).await?;

        let missing = self.ledger.incomplete(session_id, &workflow.predecessors(&node.id)).await?;
        if !missing.is_empty() {
            let error = format!("predecessors not completed: {}", missing.join(", "));
            self.ledger
                .record_failed(session_id, node, input, error.clone(), 0, started_at)
                .await?;
            return Ok(NodeOutcome::Failed(error));
        }

        self.ledger
            .record_running(session_id, node, input.clone(), started_at)
            .await?;
        self.events.publish(EngineEvent::NodeStarted {
            session_id: session_id.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type().to_string(),
        });
        debug!(session_id = %session_id, node_id = %node.id, node_type = %node.node_type(), "Node started");

        let ctx = NodeContext {
            session_id: session_id.clone(),
            node_id: node.id.clone(),
            data: self.data.clone(),
            resolver: self.resolver.clone(),
            services: self.services.clone(),
        };
        let timer = Instant::now();
        let result = match AssertUnwindSafe(self.executors.execute(ctx, node.config.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(SluiceError::executor(
                node.node_type().to_string(),
                format!("executor panicked: {}", panic_message(payload.as_ref())),
            )),
        };
        let duration_ms = timer.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                if let Some(key) = node.config.output_key() {
                    self.data
                        .put(session_id, key, output.data.clone(), &node.id, output.kind)
                        .await?;
                }
                self.ledger
                    .record_completed(session_id, node, input, output.data.clone(), duration_ms, started_at)
                    .await?;
                info!(session_id = %session_id, node_id = %node.id, duration_ms, "Node completed");
                self.events.publish(EngineEvent::NodeCompleted {
                    session_id: session_id.clone(),
                    node_id: node.id.clone(),
                    duration_ms,
                    output: output.data,
                });
                Ok(NodeOutcome::Completed)
            }
            Err(e) if e.is_node_failure() => {
                let message = e.to_string();
                warn!(session_id = %session_id, node_id = %node.id, duration_ms, error = %message, "Node failed");
                self.ledger
                    .record_failed(session_id, node, input, message.clone(), duration_ms, started_at)
                    .await?;
                self.events.publish(EngineEvent::NodeFailed {
                    session_id: session_id.clone(),
                    node_id: node.id.clone(),
                    duration_ms,
                    error: message.clone(),
                });
                Ok(NodeOutcome::Failed(message))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::NodeStatus;
    use sluice_test_utils::{data_source_node, linear_workflow, services, InMemoryStore, MockRelational};
    use std::time::Duration;

    #[tokio::test]
    async fn test_builder_requires_repositories() {
        let err = Orchestrator::builder().build().err().unwrap();
        assert!(err.to_string().contains("repository"));
    }

    #[tokio::test]
    async fn test_input_snapshot_holds_config() {
        let store = Arc::new(InMemoryStore::new());
        let db = Arc::new(MockRelational::with_rows(serde_json::json!([{"n": 1}])));
        let wf = linear_workflow("wf", vec![("fetch", data_source_node("SELECT 1", "rows"))]);
        store.save_workflow(&wf).await.unwrap();
        let engine = Orchestrator::builder()
            .store(store.clone())
            .services(services(store.clone(), Some(db), None, None))
            .build()
            .unwrap();

        let session = engine.run_session("wf", "snap", "test").await.unwrap();
        let records = engine.list_node_executions(&session.id).await.unwrap();
        let fetch = records.iter().find(|r| r.node_id == "fetch").unwrap();
        assert_eq!(fetch.input["config"]["type"], "dataSource");
        assert_eq!(fetch.input["config"]["config"]["query"], "SELECT 1");
    }

    #[tokio::test]
    async fn test_node_with_unfinished_predecessor_fails() {
        let store = Arc::new(InMemoryStore::new());
        let db = Arc::new(MockRelational::with_rows(serde_json::json!([])));
        let wf = linear_workflow("wf", vec![("fetch", data_source_node("SELECT 1", "rows"))]);
        let engine = Orchestrator::builder()
            .store(store.clone())
            .services(services(store.clone(), Some(db.clone()), None, None))
            .build()
            .unwrap();

        // "start" never ran, so "fetch" must not dispatch.
        let session = SessionId::new();
        let node = wf.node("fetch").unwrap();
        let outcome = engine.inner.run_node(&session, &wf, node).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Failed("predecessors not completed: start".into()));
        assert!(db.calls().is_empty());

        let records = store.ledger();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id, "fetch");
        assert_eq!(records[0].status, NodeStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("predecessors not completed: start"));
    }

    #[tokio::test]
    async fn test_finished_runs_are_pruned() {
        let store = Arc::new(InMemoryStore::new());
        store.save_workflow(&linear_workflow("wf", vec![])).await.unwrap();
        let engine = Orchestrator::builder()
            .store(store.clone())
            .services(services(store, None, None, None))
            .build()
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            let session = engine.start_session("wf", &format!("fire-{}", i), "test").await.unwrap();
            ids.push(session.id);
        }
        for id in &ids {
            for _ in 0..100 {
                if engine.get_session_status(id).await.unwrap().status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        for _ in 0..100 {
            if engine.lock_active().values().all(|run| !run.is_live()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let last = engine.start_session("wf", "last", "test").await.unwrap();
        let active = engine.lock_active();
        assert!(active.len() <= 1);
        assert!(active.contains_key(&last.id));
    }
}
