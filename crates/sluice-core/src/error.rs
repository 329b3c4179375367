use thiserror::Error;

use crate::validation::ValidationReport;

#[derive(Debug, Error)]
pub enum SluiceError {
    // Workflow errors
    #[error("Workflow validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow is inactive: {0}")]
    WorkflowInactive(String),

    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    Executor { node: String, message: String },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    Timeout { node: String, timeout_secs: u64 },

    #[error("Session data not found: {key}")]
    DataNotFound { key: String },

    #[error("No executor registered for node type: {0}")]
    UnknownNodeType(String),

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Resource registry errors
    #[error("Resource not found: {kind} {id}")]
    ResourceNotFound { kind: String, id: String },

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SluiceError {
    /// Build an executor error for the given node type or id.
    pub fn executor(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Executor {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Errors that end a single node but leave the engine healthy.
    ///
    /// Anything else (store failures above all) is fatal to the session task
    /// and is propagated instead of being written to the ledger.
    pub fn is_node_failure(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_fatal() {
        assert!(!SluiceError::Store("disk full".into()).is_node_failure());
        assert!(SluiceError::executor("fetch", "boom").is_node_failure());
        assert!(SluiceError::DataNotFound { key: "rows".into() }.is_node_failure());
        assert!(SluiceError::Timeout {
            node: "script".into(),
            timeout_secs: 5
        }
        .is_node_failure());
    }

    #[test]
    fn test_display() {
        let e = SluiceError::executor("api_call", "HTTP 503");
        assert_eq!(e.to_string(), "Node execution failed: api_call: HTTP 503");
        let e = SluiceError::DataNotFound { key: "rows".into() };
        assert_eq!(e.to_string(), "Session data not found: rows");
    }
}
