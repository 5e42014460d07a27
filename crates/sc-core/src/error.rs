//! Core error type shared across the workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Malformed fact line (expected 3 field separators): {0}")]
    MalformedFact(String),

    #[error("Empty field in fact line: {0}")]
    EmptyField(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
