use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::failover::FailoverError;
use crate::integrity::IntegrityError;
use crate::provider::ProviderError;

use super::StageName;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("{0}")]
    Failover(#[from] FailoverError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid story: {0}")]
    Story(String),
    #[error("{tool} failed with status {status:?}: {stderr}")]
    Tool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("no {tool} command configured")]
    ToolNotConfigured { tool: &'static str },
    #[error("no upload credentials found (looked for {})", display_paths(.candidates))]
    MissingUploadCredentials { candidates: Vec<PathBuf> },
    #[error("expected artifact {path} was not produced")]
    MissingArtifact { path: PathBuf },
    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: StageName,
        #[source]
        source: Box<PipelineError>,
    },
    #[error("assets still drift after {rounds} regeneration rounds")]
    IntegrityNotConverged { rounds: usize },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            source,
            path: path.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
