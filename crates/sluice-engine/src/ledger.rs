use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use sluice_core::error::Result;
use sluice_core::traits::LedgerRepository;
use sluice_core::types::{NodeExecutionRecord, NodeStatus, SessionId};
use sluice_core::workflow::WorkflowNode;

/// Append-only record of node invocations.
///
/// A node contributes one `running` record when it starts and one terminal
/// record when it finishes. Records are never updated.
pub struct ExecutionLedger {
    repo: Arc<dyn LedgerRepository>,
}

impl ExecutionLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        session: &SessionId,
        node: &WorkflowNode,
        status: NodeStatus,
        input: Value,
        output: Option<Value>,
        error: Option<String>,
        duration_ms: Option<u64>,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let record = NodeExecutionRecord {
            seq: 0,
            session_id: session.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type().to_string(),
            status,
            input,
            output,
            error,
            duration_ms,
            started_at,
            recorded_at: Utc::now(),
        };
        let seq = self.repo.append(&record).await?;
        debug!(session_id = %session, node_id = %node.id, status = status.as_str(), seq, "Ledger record appended");
        Ok(seq)
    }

    pub async fn record_running(
        &self,
        session: &SessionId,
        node: &WorkflowNode,
        input: Value,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.append(session, node, NodeStatus::Running, input, None, None, None, started_at)
            .await
    }

    pub async fn record_completed(
        &self,
        session: &SessionId,
        node: &WorkflowNode,
        input: Value,
        output: Value,
        duration_ms: u64,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.append(
            session,
            node,
            NodeStatus::Completed,
            input,
            Some(output),
            None,
            Some(duration_ms),
            started_at,
        )
        .await
    }

    pub async fn record_failed(
        &self,
        session: &SessionId,
        node: &WorkflowNode,
        input: Value,
        error: String,
        duration_ms: u64,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.append(
            session,
            node,
            NodeStatus::Failed,
            input,
            None,
            Some(error),
            Some(duration_ms),
            started_at,
        )
        .await
    }

    /// All records of a session in append order.
    pub async fn records_for_session(&self, session: &SessionId) -> Result<Vec<NodeExecutionRecord>> {
        self.repo.records(session).await
    }

    /// Status of the most recent record for a node.
    pub async fn latest_status(&self, session: &SessionId, node_id: &str) -> Result<Option<NodeStatus>> {
        let records = self.repo.records(session).await?;
        Ok(latest(&records, node_id))
    }

    /// Predecessors whose latest record is not `completed`.
    pub async fn incomplete<'a>(&self, session: &SessionId, node_ids: &[&'a str]) -> Result<Vec<&'a str>> {
        if node_ids.is_empty() {
            return Ok(vec![]);
        }
        let records = self.repo.records(session).await?;
        Ok(node_ids
            .iter()
            .copied()
            .filter(|id| latest(&records, id) != Some(NodeStatus::Completed))
            .collect())
    }
}

fn latest(records: &[NodeExecutionRecord], node_id: &str) -> Option<NodeStatus> {
    records
        .iter()
        .rev()
        .find(|r| r.node_id == node_id)
        .map(|r| r.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::workflow::NodeConfig;
    use sluice_test_utils::InMemoryStore;

    #[tokio::test]
    async fn test_running_then_terminal() {
        let ledger = ExecutionLedger::new(Arc::new(InMemoryStore::new()));
        let session = SessionId::from_str("s1");
        let node = WorkflowNode::new("fetch", "Fetch", 1, NodeConfig::Start);
        let started = Utc::now();

        ledger.record_running(&session, &node, json!({}), started).await.unwrap();
        assert_eq!(
            ledger.latest_status(&session, "fetch").await.unwrap(),
            Some(NodeStatus::Running)
        );
        assert_eq!(ledger.incomplete(&session, &["fetch"]).await.unwrap(), vec!["fetch"]);

        ledger
            .record_completed(&session, &node, json!({}), json!([1]), 12, started)
            .await
            .unwrap();
        assert_eq!(
            ledger.latest_status(&session, "fetch").await.unwrap(),
            Some(NodeStatus::Completed)
        );
        assert!(ledger.incomplete(&session, &["fetch"]).await.unwrap().is_empty());

        let records = ledger.records_for_session(&session).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].seq < records[1].seq);
        assert_eq!(records[1].duration_ms, Some(12));
        assert_eq!(ledger.latest_status(&session, "other").await.unwrap(), None);
    }
}
