use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::persist::write_json_atomic;

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
    #[error("integrity record {path} is corrupt: {source}")]
    Corrupt {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type IntegrityResult<T> = std::result::Result<T, IntegrityError>;

/// Streams `reader` through SHA-256 in `chunk_size` pieces.
pub fn hash_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_file(path: &Path) -> IntegrityResult<String> {
    let io_err = |source| IntegrityError::Io {
        source,
        path: path.to_path_buf(),
    };
    let file = File::open(path).map_err(io_err)?;
    hash_reader(file, HASH_CHUNK).map_err(io_err)
}

fn record_key(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub mismatched: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub untracked: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }

    /// Files whose content can no longer be trusted.
    pub fn drifted(&self) -> impl Iterator<Item = &PathBuf> {
        self.mismatched.iter().chain(self.missing.iter())
    }
}

/// Absolute path to SHA-256 digest of every artifact a completed stage produced.
#[derive(Debug)]
pub struct IntegrityRecord {
    path: PathBuf,
    hashes: BTreeMap<String, String>,
}

impl IntegrityRecord {
    pub fn load(path: impl Into<PathBuf>) -> IntegrityResult<Self> {
        let path = path.into();
        let hashes = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| IntegrityError::Corrupt {
                    source,
                    path: path.clone(),
                })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(IntegrityError::Io { source, path }),
        };
        Ok(Self { path, hashes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn digest(&self, file: &Path) -> Option<&str> {
        self.hashes.get(&record_key(file)).map(String::as_str)
    }

    pub fn save(&self) -> IntegrityResult<()> {
        write_json_atomic(&self.path, &self.hashes).map_err(|source| IntegrityError::Io {
            source,
            path: self.path.clone(),
        })
    }

    /// Hashes `files` and stores their digests, then saves the record.
    pub fn record<P: AsRef<Path>>(&mut self, files: &[P]) -> IntegrityResult<()> {
        for file in files {
            let file = file.as_ref();
            let digest = hash_file(file)?;
            debug!(path = %file.display(), %digest, "recorded artifact hash");
            self.hashes.insert(record_key(file), digest);
        }
        self.save()
    }

    pub fn forget<P: AsRef<Path>>(&mut self, files: &[P]) -> IntegrityResult<()> {
        for file in files {
            self.hashes.remove(&record_key(file.as_ref()));
        }
        self.save()
    }

    /// Compares `files` against their recorded digests. Never updates the record.
    pub fn verify<P: AsRef<Path>>(&self, files: &[P]) -> IntegrityResult<VerifyReport> {
        let mut report = VerifyReport::default();
        for file in files {
            let file = file.as_ref();
            let Some(expected) = self.hashes.get(&record_key(file)) else {
                warn!(path = %file.display(), "no recorded hash; skipping");
                report.untracked.push(file.to_path_buf());
                continue;
            };
            if !file.exists() {
                warn!(path = %file.display(), "tracked artifact missing");
                report.missing.push(file.to_path_buf());
                continue;
            }
            let actual = hash_file(file)?;
            if &actual != expected {
                warn!(path = %file.display(), %expected, %actual, "artifact hash mismatch");
                report.mismatched.push(file.to_path_buf());
            }
        }
        Ok(report)
    }
}
