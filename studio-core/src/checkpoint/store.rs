use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::persist::write_json_atomic;

use super::error::{CheckpointError, CheckpointResult};
use super::models::{OperationKind, OperationState, OperationStatus, ProjectState};

pub fn checkpoint_file_name(project_name: &str) -> String {
    format!(".checkpoint_{project_name}.json")
}

/// What `start` found for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEntry {
    Started,
    AlreadyCompleted,
    Resumed { current: u64, total: u64 },
    Restarted,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub current_item: Option<u64>,
    pub progress: Option<f64>,
    pub output_files: Vec<String>,
}

impl ProgressUpdate {
    pub fn item(current_item: u64) -> Self {
        Self {
            current_item: Some(current_item),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, file: impl Into<String>) -> Self {
        self.output_files.push(file.into());
        self
    }
}

/// Persistent per-project operation state, rewritten atomically on every
/// mutation.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: ProjectState,
}

impl CheckpointStore {
    pub fn open(project_name: &str, project_dir: &Path) -> CheckpointResult<Self> {
        let path = project_dir.join(checkpoint_file_name(project_name));
        let state = match read_state(&path)? {
            Some(state) => {
                info!(project = project_name, path = %path.display(), "resuming from checkpoint");
                state
            }
            None => ProjectState::new(project_name, project_dir.display().to_string()),
        };
        let store = Self { path, state };
        store.persist()?;
        Ok(store)
    }

    /// Reads a project's checkpoint without creating one.
    pub fn load_existing(project_name: &str, project_dir: &Path) -> CheckpointResult<Option<ProjectState>> {
        read_state(&project_dir.join(checkpoint_file_name(project_name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn operation(&self, stage: &str) -> Option<&OperationState> {
        self.state.operations.get(stage)
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.operation(stage)
            .map(OperationState::is_completed)
            .unwrap_or(false)
    }

    pub fn output_files(&self, stage: &str) -> Vec<String> {
        self.operation(stage)
            .map(|op| op.output_files.clone())
            .unwrap_or_default()
    }

    /// Item index to continue from; only meaningful while in progress.
    pub fn resume_point(&self, stage: &str) -> Option<u64> {
        self.operation(stage)
            .filter(|op| op.status == OperationStatus::InProgress)
            .map(|op| op.current_item)
    }

    pub fn start(&mut self, stage: &str, kind: OperationKind, total_items: u64) -> CheckpointResult<StageEntry> {
        let status = self.operation(stage).map(|op| op.status);
        let entry = match status {
            Some(OperationStatus::Completed) => {
                debug!(stage, "operation already completed");
                return Ok(StageEntry::AlreadyCompleted);
            }
            Some(OperationStatus::InProgress) => {
                let op = self.operation_mut(stage)?;
                if total_items > 0 {
                    op.total_items = total_items;
                }
                info!(stage, current = op.current_item, total = op.total_items, "resuming operation");
                StageEntry::Resumed {
                    current: op.current_item,
                    total: op.total_items,
                }
            }
            Some(OperationStatus::Failed) => {
                let op = self.operation_mut(stage)?;
                warn!(stage, previous_error = ?op.error_message, "restarting failed operation");
                op.status = OperationStatus::InProgress;
                op.error_message = None;
                op.end_time = None;
                if total_items > 0 {
                    op.total_items = total_items;
                }
                StageEntry::Restarted
            }
            Some(OperationStatus::NotStarted) | None => {
                let mut op = OperationState::new(kind);
                op.status = OperationStatus::InProgress;
                op.total_items = total_items;
                op.start_time = Some(Utc::now());
                self.state.operations.insert(stage.to_string(), op);
                info!(stage, total = total_items, "operation started");
                StageEntry::Started
            }
        };
        self.touch_and_persist()?;
        Ok(entry)
    }

    pub fn update_progress(&mut self, stage: &str, update: ProgressUpdate) -> CheckpointResult<()> {
        let op = self.operation_mut(stage)?;
        if let Some(current) = update.current_item {
            op.current_item = current;
        }
        match update.progress {
            Some(progress) => op.progress = progress.clamp(0.0, 1.0),
            None => op.recompute_progress(),
        }
        op.push_outputs(update.output_files);
        self.touch_and_persist()
    }

    pub fn complete(&mut self, stage: &str, output_files: Vec<String>) -> CheckpointResult<()> {
        let op = self.operation_mut(stage)?;
        op.status = OperationStatus::Completed;
        op.progress = 1.0;
        op.current_item = op.total_items;
        op.error_message = None;
        op.end_time = Some(Utc::now());
        op.push_outputs(output_files);
        info!(stage, outputs = op.output_files.len(), "operation completed");
        self.touch_and_persist()
    }

    pub fn fail(&mut self, stage: &str, message: impl Into<String>) -> CheckpointResult<()> {
        let message = message.into();
        let op = self.operation_mut(stage)?;
        op.status = OperationStatus::Failed;
        op.error_message = Some(message.clone());
        op.end_time = Some(Utc::now());
        warn!(stage, error = %message, "operation failed");
        self.touch_and_persist()
    }

    /// Puts `stage` back to a pristine `NotStarted` entry.
    pub fn reset(&mut self, stage: &str, kind: OperationKind) -> CheckpointResult<()> {
        self.state
            .operations
            .insert(stage.to_string(), OperationState::new(kind));
        info!(stage, "operation reset");
        self.touch_and_persist()
    }

    pub fn set_metadata(&mut self, stage: &str, key: &str, value: Value) -> CheckpointResult<()> {
        let op = self.operation_mut(stage)?;
        op.metadata.insert(key.to_string(), value);
        self.touch_and_persist()
    }

    /// Deletes temporary directories and the checkpoint file once every
    /// listed stage is complete. Returns whether cleanup happened.
    pub fn cleanup_on_full_success(&self, stages: &[&str], temp_dirs: &[PathBuf]) -> CheckpointResult<bool> {
        if let Some(pending) = stages.iter().find(|stage| !self.is_completed(stage)) {
            info!(stage = *pending, "pipeline incomplete; keeping checkpoint");
            return Ok(false);
        }
        for dir in temp_dirs {
            match fs::remove_dir_all(dir) {
                Ok(()) => debug!(path = %dir.display(), "removed temporary directory"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CheckpointError::Cleanup {
                        source,
                        path: dir.clone(),
                    })
                }
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CheckpointError::Cleanup {
                    source,
                    path: self.path.clone(),
                })
            }
        }
        info!(project = %self.state.project_name, "all stages completed; checkpoint removed");
        Ok(true)
    }

    fn operation_mut(&mut self, stage: &str) -> CheckpointResult<&mut OperationState> {
        self.state
            .operations
            .get_mut(stage)
            .ok_or_else(|| CheckpointError::UnknownStage {
                stage: stage.to_string(),
            })
    }

    fn touch_and_persist(&mut self) -> CheckpointResult<()> {
        self.state.last_updated = Utc::now();
        self.state.global_status = self.state.derive_status();
        self.persist()
    }

    fn persist(&self) -> CheckpointResult<()> {
        write_json_atomic(&self.path, &self.state).map_err(|source| CheckpointError::Persist {
            source,
            path: self.path.clone(),
        })
    }
}

fn read_state(path: &Path) -> CheckpointResult<Option<ProjectState>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Read {
                source,
                path: path.to_path_buf(),
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| CheckpointError::Corrupt {
            source,
            path: path.to_path_buf(),
        })
}
