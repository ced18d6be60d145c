use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Scenario,
    Image,
    Audio,
    Video,
    Upload,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Scenario => "scenario",
            OperationKind::Image => "image",
            OperationKind::Audio => "audio",
            OperationKind::Video => "video",
            OperationKind::Upload => "upload",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::NotStarted => "not_started",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(OperationStatus::NotStarted),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("unknown operation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationState {
    pub operation_type: OperationKind,
    pub status: OperationStatus,
    pub progress: f64,
    pub current_item: u64,
    pub total_items: u64,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl OperationState {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            operation_type: kind,
            status: OperationStatus::NotStarted,
            progress: 0.0,
            current_item: 0,
            total_items: 0,
            output_files: Vec::new(),
            error_message: None,
            start_time: None,
            end_time: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }

    /// Appends outputs not already listed, keeping first-seen order.
    pub fn push_outputs<I>(&mut self, files: I)
    where
        I: IntoIterator<Item = String>,
    {
        for file in files {
            if !self.output_files.contains(&file) {
                self.output_files.push(file);
            }
        }
    }

    pub fn recompute_progress(&mut self) {
        if self.total_items > 0 {
            self.progress = (self.current_item as f64 / self.total_items as f64).clamp(0.0, 1.0);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectState {
    pub project_name: String,
    pub project_path: String,
    pub creation_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub global_status: OperationStatus,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationState>,
}

impl ProjectState {
    pub fn new(project_name: impl Into<String>, project_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_name: project_name.into(),
            project_path: project_path.into(),
            creation_time: now,
            last_updated: now,
            global_status: OperationStatus::NotStarted,
            operations: BTreeMap::new(),
        }
    }

    /// Overall status derived from the recorded operations.
    pub fn derive_status(&self) -> OperationStatus {
        let statuses: Vec<_> = self.operations.values().map(|op| op.status).collect();
        if statuses.is_empty() {
            OperationStatus::NotStarted
        } else if statuses.contains(&OperationStatus::Failed) {
            OperationStatus::Failed
        } else if statuses.iter().all(|status| *status == OperationStatus::Completed) {
            OperationStatus::Completed
        } else if statuses.iter().all(|status| *status == OperationStatus::NotStarted) {
            OperationStatus::NotStarted
        } else {
            OperationStatus::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_status_tracks_operations() {
        let mut state = ProjectState::new("demo", "/tmp/demo");
        assert_eq!(state.derive_status(), OperationStatus::NotStarted);

        let mut done = OperationState::new(OperationKind::Scenario);
        done.status = OperationStatus::Completed;
        state.operations.insert("senaryo".into(), done);
        state
            .operations
            .insert("kurgu".into(), OperationState::new(OperationKind::Video));
        assert_eq!(state.derive_status(), OperationStatus::InProgress);

        state.operations.get_mut("kurgu").unwrap().status = OperationStatus::Failed;
        assert_eq!(state.derive_status(), OperationStatus::Failed);
    }

    #[test]
    fn outputs_are_deduplicated() {
        let mut op = OperationState::new(OperationKind::Audio);
        op.push_outputs(vec!["a.wav".to_string(), "b.wav".to_string()]);
        op.push_outputs(vec!["a.wav".to_string()]);
        assert_eq!(op.output_files, vec!["a.wav", "b.wav"]);
    }
}
