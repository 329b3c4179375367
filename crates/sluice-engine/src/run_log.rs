use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sluice_core::event::{EventBus, SessionEvents};
use sluice_core::types::{EngineEvent, SessionId};

/// JSONL runtime logger for one session.
///
/// Writes one JSON object per line to `{log_dir}/{session_id}/{timestamp}.jsonl`,
/// flushing after each entry so a crash loses nothing already written.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = session summary, 2 = per node, 3 = per node with output previews.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in the background until the session finishes.
    ///
    /// Subscribing before the session task starts guarantees the first
    /// events are captured.
    pub fn spawn(self, bus: &EventBus, session_id: SessionId, cancel: CancellationToken) -> JoinHandle<()> {
        let events = bus.subscribe_session(session_id);
        tokio::spawn(self.run(events, cancel))
    }

    pub async fn run(self, mut events: SessionEvents, cancel: CancellationToken) {
        let session_dir = self.log_dir.join(events.session_id().as_str());
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                next = events.recv() => {
                    let Some(event) = next else {
                        debug!("Session events ended, RunLogger stopping");
                        break;
                    };
                    if let Some(entry) = self.event_to_entry(&event) {
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry; `None` when filtered by level.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: event.session_id().to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.map(String::from),
            detail,
        };

        match event {
            // L1: session summary
            EngineEvent::SessionStarted { workflow_id, .. } => Some(entry(
                "session_started",
                None,
                Some(serde_json::json!({ "workflow_id": workflow_id })),
            )),
            EngineEvent::SessionFinished { status, error, .. } => Some(entry(
                "session_finished",
                None,
                Some(serde_json::json!({ "status": status, "error": error })),
            )),

            // L2: per node
            EngineEvent::NodeStarted { node_id, node_type, .. } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "node_type": node_type })),
            )),
            EngineEvent::NodeCompleted {
                node_id,
                duration_ms,
                output,
                ..
            } if self.level >= 2 => {
                let mut detail = serde_json::json!({ "duration_ms": duration_ms });
                if self.level >= 3 {
                    detail["output_preview"] = serde_json::Value::String(truncate_json(output, 500));
                }
                Some(entry("node_completed", Some(node_id.as_str()), Some(detail)))
            }
            EngineEvent::NodeFailed {
                node_id,
                duration_ms,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "duration_ms": duration_ms, "error": error })),
            )),

            _ => None,
        }
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
