use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::SessionRepository;
use sluice_core::types::{SessionId, SessionStatus, WorkflowSession};

/// Owns session rows and enforces the status state machine.
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
}

impl SessionManager {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo }
    }

    /// Create a `pending` session.
    pub async fn create(
        &self,
        workflow_id: &str,
        name: &str,
        created_by: &str,
        metadata: serde_json::Value,
    ) -> Result<WorkflowSession> {
        let mut session = WorkflowSession::new(workflow_id, name, created_by);
        session.metadata = metadata;
        self.repo.create_session(&session).await?;
        info!(session_id = %session.id, workflow_id, created_by, "Session created");
        Ok(session)
    }

    pub async fn get(&self, id: &SessionId) -> Result<WorkflowSession> {
        self.repo
            .get_session(id)
            .await?
            .ok_or_else(|| SluiceError::SessionNotFound(id.to_string()))
    }

    /// Move a session to `next`, stamping start/finish times.
    pub async fn transition(&self, id: &SessionId, next: SessionStatus, error: Option<String>) -> Result<WorkflowSession> {
        let mut session = self.get(id).await?;
        if !session.status.can_transition_to(next) {
            return Err(SluiceError::InvalidTransition {
                from: session.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == SessionStatus::Running {
            session.started_at = Some(now);
        }
        if next.is_terminal() {
            session.finished_at = Some(now);
        }
        session.status = next;
        session.error = error;
        self.repo.update_session(&session).await?;
        info!(session_id = %id, status = %next, "Session transitioned");
        Ok(session)
    }

    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<WorkflowSession>> {
        self.repo.list_sessions_by_status(status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_test_utils::InMemoryStore;

    #[tokio::test]
    async fn test_lifecycle_timestamps() {
        let sessions = SessionManager::new(Arc::new(InMemoryStore::new()));
        let s = sessions.create("wf", "nightly", "alice", json!({"run": 1})).await.unwrap();
        assert_eq!(s.status, SessionStatus::Pending);

        let s = sessions.transition(&s.id, SessionStatus::Running, None).await.unwrap();
        assert!(s.started_at.is_some());
        assert!(s.finished_at.is_none());

        let s = sessions
            .transition(&s.id, SessionStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert!(s.finished_at.is_some());
        assert_eq!(s.error.as_deref(), Some("boom"));
        assert_eq!(sessions.get(&s.id).await.unwrap().metadata, json!({"run": 1}));
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let sessions = SessionManager::new(Arc::new(InMemoryStore::new()));
        let s = sessions.create("wf", "n", "bob", json!({})).await.unwrap();
        sessions.transition(&s.id, SessionStatus::Cancelled, None).await.unwrap();
        let err = sessions
            .transition(&s.id, SessionStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let sessions = SessionManager::new(Arc::new(InMemoryStore::new()));
        let err = sessions.get(&SessionId::from_str("nope")).await.unwrap_err();
        assert!(matches!(err, SluiceError::SessionNotFound(_)));
    }
}
