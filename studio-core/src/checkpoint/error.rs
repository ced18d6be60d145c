use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("checkpoint {path} is corrupt: {source}")]
    Corrupt {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to persist checkpoint {path}: {source}")]
    Persist {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to remove {path}: {source}")]
    Cleanup {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("operation {stage} was never started")]
    UnknownStage { stage: String },
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;
