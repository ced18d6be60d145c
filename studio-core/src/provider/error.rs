use std::path::PathBuf;

use thiserror::Error;

use super::{Capability, ProviderKey, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("quota exhausted (status {status}): {body}")]
    Quota { status: u16, body: String },
    #[error("credential {name} for {key} is not set")]
    MissingCredential { key: ProviderKey, name: String },
    #[error("{kind} does not support {capability}")]
    Unsupported {
        kind: ProviderKind,
        capability: Capability,
    },
    #[error("{key} has no model configured for {capability}")]
    MissingModel {
        key: ProviderKey,
        capability: Capability,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
