pub mod backend;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod story;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::checkpoint::OperationKind;

pub use backend::{ExternalTools, ProductionBrief, StageBackend, StudioBackend};
pub use error::{PipelineError, PipelineResult};
pub use layout::{slugify, ProjectLayout};
pub use orchestrator::{tracked_artifacts, Orchestrator, OrchestratorSettings, RunSummary, StageOutcome};
pub use story::{SegmentAsset, Story};

/// Checkpoint name of the narration half of the asset stage.
pub const SPEECH_OPERATION: &str = "varlik_uretimi.ses";
/// Checkpoint name of the illustration half of the asset stage.
pub const IMAGE_OPERATION: &str = "varlik_uretimi.gorsel";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageName {
    #[serde(rename = "senaryo")]
    Scenario,
    #[serde(rename = "yonetmen")]
    Direction,
    #[serde(rename = "varlik_uretimi")]
    Assets,
    #[serde(rename = "kurgu")]
    Edit,
    #[serde(rename = "youtube_upload")]
    Upload,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Scenario,
        StageName::Direction,
        StageName::Assets,
        StageName::Edit,
        StageName::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Scenario => "senaryo",
            StageName::Direction => "yonetmen",
            StageName::Assets => "varlik_uretimi",
            StageName::Edit => "kurgu",
            StageName::Upload => "youtube_upload",
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            StageName::Scenario | StageName::Direction => OperationKind::Scenario,
            StageName::Assets => OperationKind::Audio,
            StageName::Edit => OperationKind::Video,
            StageName::Upload => OperationKind::Upload,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// This stage followed by every stage after it.
    pub fn with_downstream(&self) -> &'static [StageName] {
        &Self::ALL[self.index()..]
    }

    /// Checkpoint entries owned by this stage besides its own.
    pub fn sub_operations(&self) -> &'static [(&'static str, OperationKind)] {
        match self {
            StageName::Assets => &[
                (SPEECH_OPERATION, OperationKind::Audio),
                (IMAGE_OPERATION, OperationKind::Image),
            ],
            _ => &[],
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(StageName::as_str).collect()
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_follows_fixed_order() {
        assert_eq!(
            StageName::Assets.with_downstream(),
            &[StageName::Assets, StageName::Edit, StageName::Upload]
        );
        assert_eq!(StageName::Upload.with_downstream(), &[StageName::Upload]);
        assert_eq!("kurgu".parse::<StageName>().unwrap(), StageName::Edit);
        assert!("render".parse::<StageName>().is_err());
    }
}
