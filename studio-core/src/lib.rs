pub mod checkpoint;
pub mod command;
pub mod config;
pub mod error;
pub mod failover;
pub mod integrity;
pub mod ordered;
pub mod persist;
pub mod pipeline;
pub mod provider;
pub mod usage;

pub use checkpoint::{
    checkpoint_file_name, CheckpointError, CheckpointResult, CheckpointStore, OperationKind,
    OperationState, OperationStatus, ProgressUpdate, ProjectState, StageEntry,
};
pub use command::{CommandExecutor, SystemCommandExecutor};
pub use config::{
    load_studio_config, parse_studio_config, ChannelProfile, DailyTask, ProviderSettings,
    StudioConfig,
};
pub use error::{ConfigError, Result};
pub use failover::{
    ClientFactory, FailoverError, FailoverExecutor, FailoverResult, HttpClientFactory,
    RetrySettings,
};
pub use integrity::{hash_file, IntegrityError, IntegrityRecord, IntegrityResult, VerifyReport};
pub use ordered::OrderedMap;
pub use pipeline::{
    slugify, tracked_artifacts, ExternalTools, Orchestrator, OrchestratorSettings, PipelineError,
    PipelineResult, ProductionBrief, ProjectLayout, RunSummary, SegmentAsset, StageBackend,
    StageName, StageOutcome, Story, StudioBackend,
};
pub use provider::{
    AspectRatio, Capability, GenerativeClient, ImageRequest, ProviderClient, ProviderConfig,
    ProviderError, ProviderKey, ProviderKind, ProviderRegistry, ProviderResult, SpeechClip,
    SpeechRequest, TextRequest,
};
pub use usage::{
    Clock, FixedClock, SystemClock, UsageError, UsageLedger, UsageOutcome, UsageRecord,
    UsageReport, UsageStatus,
};
