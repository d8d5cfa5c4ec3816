use thiserror::Error;

/// Errors surfaced to callers of the orchestrator and the CLI.
#[derive(Debug, Error)]
pub enum BlockerError {
    #[error("A blocking operation is already running")]
    AlreadyRunning,

    #[error("No usernames left to block after removing blanks and duplicates")]
    EmptyBatch,

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Orchestrator is no longer running")]
    OrchestratorUnavailable,
}

impl BlockerError {
    /// Stable code used in protocol responses (`error` field).
    pub fn code(&self) -> &'static str {
        match self {
            BlockerError::AlreadyRunning => "AlreadyRunning",
            BlockerError::EmptyBatch => "EmptyBatch",
            BlockerError::Persistence(_) => "PersistenceFailure",
            BlockerError::OrchestratorUnavailable => "OrchestratorUnavailable",
        }
    }
}

/// Failures writing or reading the persisted operation record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace record: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
