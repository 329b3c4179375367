use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{
    LedgerRepository, ResourceRegistry, SessionDataRepository, SessionRepository, WorkflowRepository,
};
use sluice_core::types::*;
use sluice_core::workflow::Workflow;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

    CREATE TABLE IF NOT EXISTS session_data (
        session_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        kind TEXT NOT NULL,
        producer_node_id TEXT NOT NULL,
        written_at TEXT NOT NULL,
        PRIMARY KEY (session_id, key)
    );

    CREATE TABLE IF NOT EXISTS node_executions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        duration_ms INTEGER,
        started_at TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_exec_session ON node_executions(session_id, seq);

    CREATE TABLE IF NOT EXISTS prompts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        system TEXT,
        template TEXT NOT NULL,
        output_schema TEXT
    );

    CREATE TABLE IF NOT EXISTS api_definitions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        headers TEXT NOT NULL,
        body TEXT
    );

    CREATE TABLE IF NOT EXISTS scripts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        code TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> SluiceError {
    SluiceError::Store(e.to_string())
}

/// Sortable RFC 3339 timestamp (fixed microsecond precision, `Z` suffix).
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SluiceError::Store(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).map_err(db_err)
}

/// SQLite-backed engine state: workflows, sessions, session data, the node
/// execution ledger and the resource registries.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SluiceError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(db_err)?;
        f(&conn)
    }

    /// Register or replace a prompt template.
    pub fn put_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        let schema = prompt
            .output_schema
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO prompts (id, name, system, template, output_schema)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![prompt.id, prompt.name, prompt.system, prompt.template, schema],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Register or replace an API definition.
    pub fn put_api(&self, api: &ApiDefinition) -> Result<()> {
        let headers = serde_json::to_string(&api.headers)?;
        let body = api.body.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO api_definitions (id, name, url, method, headers, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![api.id, api.name, api.url, api.method, headers, body],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Register or replace a script body.
    pub fn put_script(&self, script: &ScriptDefinition) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO scripts (id, name, code) VALUES (?1, ?2, ?3)",
                params![script.id, script.name, script.code],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        created_by: row.get(4)?,
        metadata: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        error: row.get(9)?,
    })
}

/// Raw column values; converted outside the rusqlite callback so parse errors
/// surface as `SluiceError`.
struct SessionRow {
    id: String,
    workflow_id: String,
    name: String,
    status: String,
    created_by: String,
    metadata: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<WorkflowSession> {
        Ok(WorkflowSession {
            id: SessionId(self.id),
            workflow_id: self.workflow_id,
            name: self.name,
            status: self.status.parse()?,
            created_by: self.created_by,
            metadata: parse_json(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            error: self.error,
        })
    }
}

const SESSION_COLUMNS: &str =
    "id, workflow_id, name, status, created_by, metadata, created_at, started_at, finished_at, error";

impl WorkflowRepository for SqliteStore {
    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>> {
        let id = id.to_string();
        Box::pin(async move {
            let definition: Option<String> = self.with_conn(|conn| {
                conn.query_row("SELECT definition FROM workflows WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)
            })?;
            definition
                .map(|d| serde_json::from_str(&d).map_err(db_err))
                .transpose()
        })
    }

    fn save_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&workflow)?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO workflows (id, name, active, definition, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![workflow.id, workflow.name, workflow.active, definition, ts(&Utc::now())],
                )
                .map_err(db_err)?;
                Ok(())
            })?;
            debug!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "Workflow saved");
            Ok(())
        })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        Box::pin(async move {
            let definitions: Vec<String> = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT definition FROM workflows ORDER BY id")
                    .map_err(db_err)?;
                let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
            })?;
            definitions
                .iter()
                .map(|d| serde_json::from_str(d).map_err(db_err))
                .collect()
        })
    }
}

impl SessionRepository for SqliteStore {
    fn create_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>> {
        let s = session.clone();
        Box::pin(async move {
            let metadata = serde_json::to_string(&s.metadata)?;
            self.with_conn(|conn| {
                conn.execute(
                    &format!("INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)", SESSION_COLUMNS),
                    params![
                        s.id.0,
                        s.workflow_id,
                        s.name,
                        s.status.as_str(),
                        s.created_by,
                        metadata,
                        ts(&s.created_at),
                        s.started_at.as_ref().map(ts),
                        s.finished_at.as_ref().map(ts),
                        s.error,
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn get_session(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let row = self.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                    params![id],
                    row_to_session,
                )
                .optional()
                .map_err(db_err)
            })?;
            row.map(SessionRow::into_session).transpose()
        })
    }

    fn update_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>> {
        let s = session.clone();
        Box::pin(async move {
            let metadata = serde_json::to_string(&s.metadata)?;
            let changed = self.with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = ?2, metadata = ?3, started_at = ?4, finished_at = ?5, error = ?6
                     WHERE id = ?1",
                    params![
                        s.id.0,
                        s.status.as_str(),
                        metadata,
                        s.started_at.as_ref().map(ts),
                        s.finished_at.as_ref().map(ts),
                        s.error,
                    ],
                )
                .map_err(db_err)
            })?;
            if changed == 0 {
                return Err(SluiceError::SessionNotFound(s.id.0));
            }
            Ok(())
        })
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        Box::pin(async move {
            let rows = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM sessions WHERE status = ?1 ORDER BY created_at",
                        SESSION_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![status.as_str()], row_to_session)
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
            })?;
            rows.into_iter().map(SessionRow::into_session).collect()
        })
    }
}

type EntryRow = (String, String, String, String, String, String);

fn entry_from_row(row: EntryRow) -> Result<SessionDataEntry> {
    let (session_id, key, value, kind, producer_node_id, written_at) = row;
    Ok(SessionDataEntry {
        session_id: SessionId(session_id),
        key,
        value: parse_json(&value)?,
        kind: kind.parse()?,
        producer_node_id,
        written_at: parse_ts(&written_at)?,
    })
}

impl SessionDataRepository for SqliteStore {
    fn upsert_entry(&self, entry: &SessionDataEntry) -> BoxFuture<'_, Result<()>> {
        let e = entry.clone();
        Box::pin(async move {
            let value = serde_json::to_string(&e.value)?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO session_data (session_id, key, value, kind, producer_node_id, written_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(session_id, key) DO UPDATE SET
                         value = excluded.value,
                         kind = excluded.kind,
                         producer_node_id = excluded.producer_node_id,
                         written_at = excluded.written_at",
                    params![e.session_id.0, e.key, value, e.kind.as_str(), e.producer_node_id, ts(&e.written_at)],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn get_entry(&self, session: &SessionId, key: &str) -> BoxFuture<'_, Result<Option<SessionDataEntry>>> {
        let sid = session.0.clone();
        let key = key.to_string();
        Box::pin(async move {
            let row: Option<EntryRow> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT session_id, key, value, kind, producer_node_id, written_at
                     FROM session_data WHERE session_id = ?1 AND key = ?2",
                    params![sid, key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
                )
                .optional()
                .map_err(db_err)
            })?;
            row.map(entry_from_row).transpose()
        })
    }

    fn list_entries(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<SessionDataEntry>>> {
        let sid = session.0.clone();
        Box::pin(async move {
            let rows: Vec<EntryRow> = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT session_id, key, value, kind, producer_node_id, written_at
                         FROM session_data WHERE session_id = ?1
                         ORDER BY written_at, key",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![sid], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                    })
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
            })?;
            rows.into_iter().map(entry_from_row).collect()
        })
    }
}

struct RecordRow {
    seq: i64,
    session_id: String,
    node_id: String,
    node_type: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    duration_ms: Option<i64>,
    started_at: String,
    recorded_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<NodeExecutionRecord> {
        Ok(NodeExecutionRecord {
            seq: self.seq,
            session_id: SessionId(self.session_id),
            node_id: self.node_id,
            node_type: self.node_type,
            status: self.status.parse()?,
            input: parse_json(&self.input)?,
            output: self.output.as_deref().map(parse_json).transpose()?,
            error: self.error,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            started_at: parse_ts(&self.started_at)?,
            recorded_at: parse_ts(&self.recorded_at)?,
        })
    }
}

impl LedgerRepository for SqliteStore {
    fn append(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<i64>> {
        let r = record.clone();
        Box::pin(async move {
            let input = serde_json::to_string(&r.input)?;
            let output = r.output.as_ref().map(serde_json::to_string).transpose()?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO node_executions
                         (session_id, node_id, node_type, status, input, output, error, duration_ms, started_at, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        r.session_id.0,
                        r.node_id,
                        r.node_type,
                        r.status.as_str(),
                        input,
                        output,
                        r.error,
                        r.duration_ms.map(|d| d as i64),
                        ts(&r.started_at),
                        ts(&r.recorded_at),
                    ],
                )
                .map_err(db_err)?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    fn records(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<NodeExecutionRecord>>> {
        let sid = session.0.clone();
        Box::pin(async move {
            let rows = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT seq, session_id, node_id, node_type, status, input, output, error,
                                duration_ms, started_at, recorded_at
                         FROM node_executions WHERE session_id = ?1 ORDER BY seq",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![sid], |row| {
                        Ok(RecordRow {
                            seq: row.get(0)?,
                            session_id: row.get(1)?,
                            node_id: row.get(2)?,
                            node_type: row.get(3)?,
                            status: row.get(4)?,
                            input: row.get(5)?,
                            output: row.get(6)?,
                            error: row.get(7)?,
                            duration_ms: row.get(8)?,
                            started_at: row.get(9)?,
                            recorded_at: row.get(10)?,
                        })
                    })
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
            })?;
            rows.into_iter().map(RecordRow::into_record).collect()
        })
    }
}

impl ResourceRegistry for SqliteStore {
    fn get_prompt(&self, id: &str) -> BoxFuture<'_, Result<PromptTemplate>> {
        let id = id.to_string();
        Box::pin(async move {
            let row: Option<(String, String, Option<String>, String, Option<String>)> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, name, system, template, output_schema FROM prompts WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()
                .map_err(db_err)
            })?;
            let (id, name, system, template, schema) = row.ok_or_else(|| SluiceError::ResourceNotFound {
                kind: "prompt".into(),
                id: id.clone(),
            })?;
            Ok(PromptTemplate {
                id,
                name,
                system,
                template,
                output_schema: schema.as_deref().map(parse_json).transpose()?,
            })
        })
    }

    fn get_api(&self, id: &str) -> BoxFuture<'_, Result<ApiDefinition>> {
        let id = id.to_string();
        Box::pin(async move {
            let row: Option<(String, String, String, String, String, Option<String>)> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, name, url, method, headers, body FROM api_definitions WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
                )
                .optional()
                .map_err(db_err)
            })?;
            let (id, name, url, method, headers, body) = row.ok_or_else(|| SluiceError::ResourceNotFound {
                kind: "api".into(),
                id: id.clone(),
            })?;
            Ok(ApiDefinition {
                id,
                name,
                url,
                method,
                headers: serde_json::from_str(&headers).map_err(db_err)?,
                body: body.as_deref().map(parse_json).transpose()?,
            })
        })
    }

    fn get_script(&self, id: &str) -> BoxFuture<'_, Result<ScriptDefinition>> {
        let id = id.to_string();
        Box::pin(async move {
            let row: Option<(String, String, String)> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, name, code FROM scripts WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(db_err)
            })?;
            let (id, name, code) = row.ok_or_else(|| SluiceError::ResourceNotFound {
                kind: "script".into(),
                id: id.clone(),
            })?;
            Ok(ScriptDefinition { id, name, code })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::workflow::{NodeConfig, WorkflowNode};

    fn workflow() -> Workflow {
        Workflow::new("wf-1", "Daily digest")
            .with_node(WorkflowNode::new("start", "Start", 0, NodeConfig::Start))
            .with_node(WorkflowNode::new("end", "End", 1, NodeConfig::End))
            .with_edge("start", "end")
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_workflow(&workflow()).await.unwrap();

        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Daily digest");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.edges.len(), 1);
        assert!(store.get_workflow("missing").await.unwrap().is_none());
        assert_eq!(store.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = WorkflowSession::new("wf-1", "run 1", "tester");
        store.create_session(&session).await.unwrap();

        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        store.update_session(&session).await.unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert!(loaded.started_at.is_some());
        assert_eq!(loaded.created_by, "tester");

        let running = store.list_sessions_by_status(SessionStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);

        let ghost = WorkflowSession::new("wf-1", "ghost", "tester");
        assert!(matches!(
            store.update_session(&ghost).await,
            Err(SluiceError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_data_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::new();
        let mut entry = SessionDataEntry {
            session_id: sid.clone(),
            key: "rows".into(),
            value: json!([{"id": 1}]),
            kind: ValueKind::Array,
            producer_node_id: "fetch".into(),
            written_at: Utc::now(),
        };
        store.upsert_entry(&entry).await.unwrap();
        entry.value = json!({"replaced": true});
        entry.kind = ValueKind::Object;
        store.upsert_entry(&entry).await.unwrap();

        let all = store.list_entries(&sid).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, json!({"replaced": true}));
        assert_eq!(all[0].kind, ValueKind::Object);
        assert!(store.get_entry(&sid, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ledger_append_order() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::new();
        let now = Utc::now();
        let mut record = NodeExecutionRecord {
            seq: 0,
            session_id: sid.clone(),
            node_id: "fetch".into(),
            node_type: "dataSource".into(),
            status: NodeStatus::Running,
            input: json!({}),
            output: None,
            error: None,
            duration_ms: None,
            started_at: now,
            recorded_at: now,
        };
        let first = store.append(&record).await.unwrap();
        record.status = NodeStatus::Failed;
        record.error = Some("boom".into());
        record.duration_ms = Some(12);
        let second = store.append(&record).await.unwrap();
        assert!(second > first);

        let records = store.records(&sid).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, NodeStatus::Running);
        assert_eq!(records[1].status, NodeStatus::Failed);
        assert_eq!(records[1].error.as_deref(), Some("boom"));
        assert_eq!(records[1].duration_ms, Some(12));
    }

    #[tokio::test]
    async fn test_resource_registry() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put_prompt(&PromptTemplate {
                id: "summarize".into(),
                name: "Summarize".into(),
                system: Some("You are terse.".into()),
                template: "Summarize {articles}".into(),
                output_schema: Some(json!({"type": "object"})),
            })
            .unwrap();
        let prompt = store.get_prompt("summarize").await.unwrap();
        assert_eq!(prompt.template, "Summarize {articles}");
        assert_eq!(prompt.output_schema, Some(json!({"type": "object"})));

        let err = store.get_api("nope").await.unwrap_err();
        assert!(matches!(err, SluiceError::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sluice.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_workflow(&workflow()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_workflow("wf-1").await.unwrap().is_some());
    }
}
