use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::error::{Result, SluiceError};
use crate::traits::SessionDataRepository;
use crate::types::{SessionDataEntry, SessionId, ValueKind};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Session-scoped key/value space shared by the nodes of one run.
///
/// Writes to the same `(session, key)` are serialized; distinct keys proceed
/// concurrently. Entries are persisted through a [`SessionDataRepository`].
pub struct SessionDataStore {
    repo: Arc<dyn SessionDataRepository>,
    locks: Mutex<HashMap<(SessionId, String), KeyLock>>,
}

impl SessionDataStore {
    pub fn new(repo: Arc<dyn SessionDataRepository>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, session: &SessionId, key: &str) -> Result<KeyLock> {
        let mut locks = self.locks.lock().map_err(|e| SluiceError::Store(e.to_string()))?;
        Ok(locks
            .entry((session.clone(), key.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Write `value` under `key`, replacing any previous entry.
    ///
    /// `kind` defaults to the kind of `value`.
    pub async fn put(
        &self,
        session: &SessionId,
        key: &str,
        value: serde_json::Value,
        producer_node_id: &str,
        kind: Option<ValueKind>,
    ) -> Result<SessionDataEntry> {
        let lock = self.key_lock(session, key)?;
        let _guard = lock.lock().await;

        let entry = SessionDataEntry {
            session_id: session.clone(),
            key: key.to_string(),
            kind: kind.unwrap_or_else(|| ValueKind::of(&value)),
            value,
            producer_node_id: producer_node_id.to_string(),
            written_at: Utc::now(),
        };
        self.repo.upsert_entry(&entry).await?;
        debug!(session_id = %session, key, producer = producer_node_id, kind = entry.kind.as_str(), "Session data written");
        Ok(entry)
    }

    pub async fn get(&self, session: &SessionId, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.repo.get_entry(session, key).await?.map(|e| e.value))
    }

    /// Like [`get`](Self::get), but a missing key is a `DataNotFound` error.
    pub async fn require(&self, session: &SessionId, key: &str) -> Result<serde_json::Value> {
        self.get(session, key)
            .await?
            .ok_or_else(|| SluiceError::DataNotFound { key: key.to_string() })
    }

    /// All entries, ordered by write time then key.
    pub async fn all(&self, session: &SessionId) -> Result<Vec<SessionDataEntry>> {
        let mut entries = self.repo.list_entries(session).await?;
        entries.sort_by(|a, b| a.written_at.cmp(&b.written_at).then_with(|| a.key.cmp(&b.key)));
        Ok(entries)
    }

    /// Drop per-key locks held for a finished session.
    pub fn release(&self, session: &SessionId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|(sid, _), _| sid != session);
        }
    }
}
