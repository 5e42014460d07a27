//! Pipeline error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] sc_llm::ClientError),

    #[error("Stage-1 extraction failed for HADM {hadm_id}: {reason}")]
    Stage1Failed { hadm_id: i64, reason: String },

    #[error("Missing Stage-1 artifacts for HADM {0}; run stage1 first")]
    MissingStage1(i64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Risk engine error: {0}")]
    Engine(#[from] sc_engine::EngineError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
