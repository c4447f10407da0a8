//! Core error type for the Navis engine.
//!
//! `WorkflowError` is returned by every public operation in the crate:
//! definition registration, runner actions, storage, and the manager.
//! The RPC layer maps it onto JSON-RPC error codes (see `rpc::error`).

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Invalid workflow declaration. Raised at registration time only.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A runtime action was not allowed in the current state.
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure reported by the storage collaborator. Never retried.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::InvalidData(err.to_string())
    }
}

impl From<rusqlite::Error> for WorkflowError {
    fn from(err: rusqlite::Error) -> Self {
        WorkflowError::Storage(err.to_string())
    }
}
