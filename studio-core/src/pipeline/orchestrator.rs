use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::checkpoint::{CheckpointStore, OperationKind, ProgressUpdate, ProjectState, StageEntry};
use crate::config::PipelineSection;
use crate::integrity::{IntegrityRecord, VerifyReport};
use crate::persist::write_bytes_atomic;

use super::backend::{ProductionBrief, StageBackend};
use super::error::{PipelineError, PipelineResult};
use super::layout::ProjectLayout;
use super::story::{SegmentAsset, Story};
use super::{StageName, IMAGE_OPERATION, SPEECH_OPERATION};

const UPSTREAM_OF_EDIT: [StageName; 3] = [StageName::Scenario, StageName::Direction, StageName::Assets];

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub max_integrity_rounds: usize,
    pub cleanup_dirs: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&PipelineSection::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineSection) -> Self {
        Self {
            max_integrity_rounds: config.max_integrity_rounds,
            cleanup_dirs: config.cleanup_dirs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Skipped,
    Completed,
    /// The integrity gate found drift; `stages` were reset and must run again.
    Invalidated {
        stages: Vec<StageName>,
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub project: String,
    pub project_dir: PathBuf,
    pub completed: Vec<StageName>,
    pub skipped: Vec<StageName>,
    pub invalidated_files: Vec<PathBuf>,
    pub integrity_rounds: usize,
    pub cleaned_up: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |stages: &[StageName]| {
            if stages.is_empty() {
                "-".to_string()
            } else {
                stages.iter().map(StageName::as_str).collect::<Vec<_>>().join(", ")
            }
        };
        writeln!(f, "project {} ({})", self.project, self.project_dir.display())?;
        writeln!(f, "  run id:    {}", self.run_id)?;
        writeln!(f, "  completed: {}", join(&self.completed))?;
        writeln!(f, "  skipped:   {}", join(&self.skipped))?;
        if !self.invalidated_files.is_empty() {
            writeln!(
                f,
                "  regenerated after drift ({} rounds): {}",
                self.integrity_rounds,
                self.invalidated_files
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
        }
        write!(f, "  cleaned up: {}", if self.cleaned_up { "yes" } else { "no" })
    }
}

/// Checkpoint entries owned by `stage`, its own first.
fn operation_names(stage: StageName) -> impl Iterator<Item = &'static str> {
    std::iter::once(stage.as_str()).chain(stage.sub_operations().iter().map(|(name, _)| *name))
}

fn files_under(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}

/// Every artifact the edit stage depends on: recorded outputs of the upstream
/// stages plus whatever sits in the audio and image directories.
pub fn tracked_artifacts(layout: &ProjectLayout, state: Option<&ProjectState>) -> Vec<PathBuf> {
    let mut files = BTreeSet::new();
    if let Some(state) = state {
        for stage in UPSTREAM_OF_EDIT {
            for name in operation_names(stage) {
                if let Some(op) = state.operations.get(name) {
                    files.extend(op.output_files.iter().map(|rel| layout.resolve(rel)));
                }
            }
        }
    }
    for fixed in [layout.script(), layout.story()] {
        if fixed.is_file() {
            files.insert(fixed);
        }
    }
    files.extend(files_under(&layout.audio_dir()));
    files.extend(files_under(&layout.image_dir()));
    files.into_iter().collect()
}

fn remove_path(path: &Path) -> PipelineResult<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PipelineError::io(path, source)),
    }
}

#[derive(Debug, Clone, Copy)]
enum AssetHalf {
    Speech,
    Image,
}

impl AssetHalf {
    fn operation(self) -> &'static str {
        match self {
            AssetHalf::Speech => SPEECH_OPERATION,
            AssetHalf::Image => IMAGE_OPERATION,
        }
    }

    fn kind(self) -> OperationKind {
        match self {
            AssetHalf::Speech => OperationKind::Audio,
            AssetHalf::Image => OperationKind::Image,
        }
    }

    fn relative_path(self, stem: &str) -> String {
        match self {
            AssetHalf::Speech => format!("audio/{stem}.wav"),
            AssetHalf::Image => format!("images/{stem}.png"),
        }
    }
}

/// Drives one production through the fixed stage graph.
pub struct Orchestrator<B: StageBackend> {
    backend: Arc<B>,
    layout: ProjectLayout,
    brief: ProductionBrief,
    checkpoint: Mutex<CheckpointStore>,
    integrity: Mutex<IntegrityRecord>,
    settings: OrchestratorSettings,
    run_id: Uuid,
}

impl<B: StageBackend> Orchestrator<B> {
    pub fn new(
        backend: Arc<B>,
        base_dir: &Path,
        brief: ProductionBrief,
        settings: OrchestratorSettings,
    ) -> PipelineResult<Self> {
        let layout = ProjectLayout::new(base_dir, brief.channel_slug(), &brief.topic);
        layout
            .ensure_dirs()
            .map_err(|source| PipelineError::io(layout.root(), source))?;
        let checkpoint = CheckpointStore::open(&layout.project_name(), layout.root())?;
        let integrity = IntegrityRecord::load(layout.integrity_file())?;
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            project = %layout.project_name(),
            path = %layout.root().display(),
            "orchestrator ready"
        );
        Ok(Self {
            backend,
            layout,
            brief,
            checkpoint: Mutex::new(checkpoint),
            integrity: Mutex::new(integrity),
            settings,
            run_id,
        })
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> ProjectState {
        self.checkpoint().state().clone()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint().path().to_path_buf()
    }

    fn checkpoint(&self) -> MutexGuard<'_, CheckpointStore> {
        self.checkpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn integrity(&self) -> MutexGuard<'_, IntegrityRecord> {
        self.integrity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs every stage in order, looping back after integrity invalidation.
    pub async fn run(&self) -> PipelineResult<RunSummary> {
        let mut summary = RunSummary {
            run_id: self.run_id,
            project: self.layout.project_name(),
            project_dir: self.layout.root().to_path_buf(),
            completed: Vec::new(),
            skipped: Vec::new(),
            invalidated_files: Vec::new(),
            integrity_rounds: 0,
            cleaned_up: false,
        };

        let mut index = 0;
        while let Some(&stage) = StageName::ALL.get(index) {
            match self.drive_stage(stage).await? {
                StageOutcome::Skipped => {
                    summary.skipped.push(stage);
                    index += 1;
                }
                StageOutcome::Completed => {
                    summary.completed.push(stage);
                    index += 1;
                }
                StageOutcome::Invalidated { stages, files } => {
                    summary.integrity_rounds += 1;
                    if summary.integrity_rounds > self.settings.max_integrity_rounds {
                        error!(
                            rounds = self.settings.max_integrity_rounds,
                            "integrity drift persists; giving up"
                        );
                        return Err(PipelineError::IntegrityNotConverged {
                            rounds: self.settings.max_integrity_rounds,
                        });
                    }
                    warn!(
                        round = summary.integrity_rounds,
                        restart_at = ?stages.first(),
                        files = files.len(),
                        "integrity drift; re-running invalidated stages"
                    );
                    summary.invalidated_files.extend(files);
                    index = stages.first().map(StageName::index).unwrap_or(index + 1);
                }
            }
        }

        let temp_dirs: Vec<PathBuf> = self
            .settings
            .cleanup_dirs
            .iter()
            .map(|dir| self.layout.resolve(dir))
            .collect();
        summary.cleaned_up = self
            .checkpoint()
            .cleanup_on_full_success(&StageName::names(), &temp_dirs)?;
        info!(run_id = %self.run_id, project = %summary.project, "production finished");
        Ok(summary)
    }

    /// Runs one stage unless it is already complete. The edit stage first
    /// passes through the integrity gate.
    pub async fn drive_stage(&self, stage: StageName) -> PipelineResult<StageOutcome> {
        if self.checkpoint().is_completed(stage.as_str()) {
            info!(%stage, "stage already completed; skipping");
            return Ok(StageOutcome::Skipped);
        }

        if stage == StageName::Edit {
            let report = self.verify_assets()?;
            if !report.is_clean() {
                return self.invalidate(&report);
            }
        }

        let total = if stage == StageName::Assets { 2 } else { 1 };
        let entry = self.checkpoint().start(stage.as_str(), stage.kind(), total)?;
        self.checkpoint()
            .set_metadata(stage.as_str(), "run_id", json!(self.run_id.to_string()))?;
        info!(%stage, ?entry, "stage running");

        match self.execute(stage).await {
            Ok(outputs) => {
                let paths: Vec<PathBuf> = outputs.iter().map(|rel| self.layout.resolve(rel)).collect();
                self.integrity().record(&paths)?;
                self.checkpoint().complete(stage.as_str(), outputs)?;
                Ok(StageOutcome::Completed)
            }
            Err(err) => {
                error!(%stage, error = %err, "stage failed");
                if let Err(checkpoint_err) = self.checkpoint().fail(stage.as_str(), err.to_string()) {
                    warn!(%stage, error = %checkpoint_err, "could not record stage failure");
                }
                Err(PipelineError::StageFailed {
                    stage,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Re-hashes every upstream artifact against the integrity record.
    pub fn verify_assets(&self) -> PipelineResult<VerifyReport> {
        let files = {
            let checkpoint = self.checkpoint();
            tracked_artifacts(&self.layout, Some(checkpoint.state()))
        };
        let report = self.integrity().verify(&files)?;
        if report.is_clean() {
            debug!(files = files.len(), untracked = report.untracked.len(), "integrity gate passed");
        }
        Ok(report)
    }

    /// Resets the stage owning the earliest drifted file and everything after
    /// it: checkpoint entries, recorded hashes and produced files.
    fn invalidate(&self, report: &VerifyReport) -> PipelineResult<StageOutcome> {
        let drifted: Vec<PathBuf> = report.drifted().cloned().collect();
        let mut checkpoint = self.checkpoint();

        let owner = |file: &PathBuf| {
            UPSTREAM_OF_EDIT
                .into_iter()
                .find(|stage| {
                    operation_names(*stage).any(|name| {
                        checkpoint
                            .output_files(name)
                            .iter()
                            .any(|rel| &self.layout.resolve(rel) == file)
                    })
                })
                .unwrap_or(StageName::Assets)
        };
        let first = drifted.iter().map(owner).min().unwrap_or(StageName::Assets);
        let stages = first.with_downstream().to_vec();

        let mut doomed: Vec<PathBuf> = Vec::new();
        for stage in &stages {
            for name in operation_names(*stage) {
                doomed.extend(checkpoint.output_files(name).iter().map(|rel| self.layout.resolve(rel)));
            }
        }
        doomed.push(self.layout.final_video());

        self.integrity().forget(&doomed)?;
        for path in doomed.iter().chain(std::iter::once(&self.layout.temp_clips())) {
            remove_path(path)?;
        }
        for stage in &stages {
            checkpoint.reset(stage.as_str(), stage.kind())?;
            for (name, kind) in stage.sub_operations() {
                checkpoint.reset(name, *kind)?;
            }
        }

        warn!(
            stages = ?stages.iter().map(StageName::as_str).collect::<Vec<_>>(),
            files = ?drifted,
            "invalidated stages after integrity drift"
        );
        Ok(StageOutcome::Invalidated {
            stages,
            files: drifted,
        })
    }

    async fn execute(&self, stage: StageName) -> PipelineResult<Vec<String>> {
        match stage {
            StageName::Scenario => self.write_script().await,
            StageName::Direction => self.direct().await,
            StageName::Assets => self.produce_assets().await,
            StageName::Edit => self.assemble().await,
            StageName::Upload => {
                self.backend.upload(&self.layout).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn write_script(&self) -> PipelineResult<Vec<String>> {
        let script = self.backend.write_script(&self.brief).await?;
        let path = self.layout.script();
        write_bytes_atomic(&path, script.as_bytes()).map_err(|source| PipelineError::io(&path, source))?;

        let letters = script.chars().filter(|c| c.is_alphabetic()).count();
        info!(letters, target = self.brief.target_length, "script written");
        let mut checkpoint = self.checkpoint();
        let stage = StageName::Scenario.as_str();
        checkpoint.set_metadata(stage, "letter_count", json!(letters))?;
        checkpoint.set_metadata(stage, "target_length", json!(self.brief.target_length))?;
        Ok(vec!["script.txt".to_string()])
    }

    async fn direct(&self) -> PipelineResult<Vec<String>> {
        let path = self.layout.script();
        let script = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PipelineError::io(&path, source))?;
        let story = self.backend.direct(&self.brief, &script).await?;
        story.validate()?;
        let story_path = self.layout.story();
        write_bytes_atomic(&story_path, story.to_json()?.as_bytes())
            .map_err(|source| PipelineError::io(&story_path, source))?;

        let segments = story.segments().len();
        info!(segments, voice = story.voice(&self.brief.profile.voice), "story directed");
        self.checkpoint()
            .set_metadata(StageName::Direction.as_str(), "segments", json!(segments))?;
        Ok(vec!["story.json".to_string()])
    }

    async fn load_story(&self) -> PipelineResult<Story> {
        let path = self.layout.story();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PipelineError::io(&path, source))?;
        Story::parse(&raw)
    }

    async fn produce_assets(&self) -> PipelineResult<Vec<String>> {
        let story = self.load_story().await?;
        let segments = story.segments();
        let voice = story.voice(&self.brief.profile.voice);
        self.layout
            .ensure_dirs()
            .map_err(|source| PipelineError::io(self.layout.root(), source))?;

        let (speech, images) = tokio::join!(
            self.asset_worker(AssetHalf::Speech, &segments, voice),
            self.asset_worker(AssetHalf::Image, &segments, voice),
        );
        let mut outputs = speech?;
        outputs.extend(images?);
        Ok(outputs)
    }

    /// Produces one half of the assets, continuing after the last item the
    /// checkpoint saw finish.
    async fn asset_worker(
        &self,
        half: AssetHalf,
        segments: &[SegmentAsset],
        voice: &str,
    ) -> PipelineResult<Vec<String>> {
        let operation = half.operation();
        let entry = self
            .checkpoint()
            .start(operation, half.kind(), segments.len() as u64)?;
        if entry == StageEntry::AlreadyCompleted {
            return Ok(self.checkpoint().output_files(operation));
        }
        let resume = self.checkpoint().resume_point(operation).unwrap_or(0) as usize;
        if resume > 0 {
            info!(operation, resume, total = segments.len(), "resuming asset worker");
        }

        for (index, segment) in segments.iter().enumerate().skip(resume) {
            let relative = half.relative_path(&segment.stem);
            let output = self.layout.resolve(&relative);
            let result = match half {
                AssetHalf::Speech => self.backend.narrate(segment, voice, &output).await,
                AssetHalf::Image => self.backend.illustrate(segment, &output).await,
            };
            if let Err(err) = result {
                self.checkpoint().fail(operation, err.to_string())?;
                return Err(err);
            }
            self.checkpoint().update_progress(
                operation,
                ProgressUpdate::item(index as u64 + 1).with_output(relative),
            )?;
        }

        let mut checkpoint = self.checkpoint();
        checkpoint.complete(operation, Vec::new())?;
        Ok(checkpoint.output_files(operation))
    }

    async fn assemble(&self) -> PipelineResult<Vec<String>> {
        let video = self.layout.final_video();
        remove_path(&video)?;
        remove_path(&self.layout.temp_clips())?;
        self.backend.assemble(&self.layout).await?;
        if !video.is_file() {
            return Err(PipelineError::MissingArtifact { path: video });
        }
        Ok(vec!["final_video.mp4".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::OperationStatus;
    use crate::config::ChannelProfile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const STORY: &str = r#"{"youtube_bilgileri": {"seslendirmen": "Puck"},
        "hikaye_yapisi": {"giris": {"bolum_kisaltmasi": "GIR", "paragraflar": [
            {"paragraf_numarasi": 1, "segmentler": [
                {"segment_numarasi": 1, "metin": "one", "gorsel_prompt": "a"},
                {"segment_numarasi": 2, "metin": "two", "gorsel_prompt": "b"},
                {"segment_numarasi": 3, "metin": "three", "gorsel_prompt": "c"}
            ]}]}}}"#;

    #[derive(Default)]
    struct ScriptedBackend {
        narrations: AtomicUsize,
        /// Fail the speech worker on this 1-based call.
        fail_narration_at: Option<usize>,
        /// Returned unchecked from `direct` instead of `STORY`.
        raw_story: Option<&'static str>,
        assembles: AtomicUsize,
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl StageBackend for ScriptedBackend {
        async fn write_script(&self, brief: &ProductionBrief) -> PipelineResult<String> {
            Ok(format!("A story about {}.", brief.topic))
        }

        async fn direct(&self, _brief: &ProductionBrief, _script: &str) -> PipelineResult<Story> {
            match self.raw_story {
                Some(raw) => serde_json::from_str(raw).map_err(|err| PipelineError::Story(err.to_string())),
                None => Story::parse(STORY),
            }
        }

        async fn narrate(&self, segment: &SegmentAsset, voice: &str, output: &Path) -> PipelineResult<()> {
            let call = self.narrations.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_narration_at == Some(call) {
                return Err(PipelineError::Story("speech backend down".into()));
            }
            std::fs::write(output, format!("{voice}:{}", segment.text)).map_err(|e| PipelineError::io(output, e))
        }

        async fn illustrate(&self, segment: &SegmentAsset, output: &Path) -> PipelineResult<()> {
            std::fs::write(output, &segment.image_prompt).map_err(|e| PipelineError::io(output, e))
        }

        async fn assemble(&self, layout: &ProjectLayout) -> PipelineResult<()> {
            self.assembles.fetch_add(1, Ordering::SeqCst);
            std::fs::write(layout.final_video(), b"mp4").map_err(|e| PipelineError::io(layout.final_video(), e))
        }

        async fn upload(&self, _layout: &ProjectLayout) -> PipelineResult<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn brief() -> ProductionBrief {
        ProductionBrief::new("Tech Daily", "Tech AI Trends", 1500, ChannelProfile::default())
    }

    #[tokio::test]
    async fn full_run_completes_and_cleans_up() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let orchestrator =
            Orchestrator::new(Arc::clone(&backend), dir.path(), brief(), OrchestratorSettings::default()).unwrap();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.completed, StageName::ALL.to_vec());
        assert!(summary.cleaned_up);
        assert!(!orchestrator.checkpoint_path().exists());
        assert_eq!(backend.narrations.load(Ordering::SeqCst), 3);
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        let layout = orchestrator.layout();
        assert_eq!(std::fs::read_to_string(layout.audio_file("GIR-1-2")).unwrap(), "Puck:two");
        assert!(layout.image_file("GIR-1-3").is_file());
        let record = IntegrityRecord::load(layout.integrity_file()).unwrap();
        assert!(record.digest(&layout.final_video()).is_some());
    }

    #[tokio::test]
    async fn failed_asset_worker_resumes_where_it_stopped() {
        let dir = tempdir().unwrap();
        let failing = Arc::new(ScriptedBackend {
            fail_narration_at: Some(2),
            ..ScriptedBackend::default()
        });
        let orchestrator =
            Orchestrator::new(Arc::clone(&failing), dir.path(), brief(), OrchestratorSettings::default()).unwrap();
        orchestrator.drive_stage(StageName::Scenario).await.unwrap();
        orchestrator.drive_stage(StageName::Direction).await.unwrap();
        let err = orchestrator.drive_stage(StageName::Assets).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { stage: StageName::Assets, .. }));

        let state = orchestrator.state();
        let speech = &state.operations[SPEECH_OPERATION];
        assert_eq!(speech.status, OperationStatus::Failed);
        assert_eq!(speech.current_item, 1);
        assert_eq!(state.operations[IMAGE_OPERATION].status, OperationStatus::Completed);
        assert_eq!(state.operations["varlik_uretimi"].status, OperationStatus::Failed);
        drop(orchestrator);

        let healthy = Arc::new(ScriptedBackend::default());
        let resumed =
            Orchestrator::new(Arc::clone(&healthy), dir.path(), brief(), OrchestratorSettings::default()).unwrap();
        assert_eq!(
            resumed.drive_stage(StageName::Scenario).await.unwrap(),
            StageOutcome::Skipped
        );
        resumed.drive_stage(StageName::Assets).await.unwrap();
        assert_eq!(healthy.narrations.load(Ordering::SeqCst), 2);
        let outputs = resumed.state().operations["varlik_uretimi"].output_files.clone();
        assert_eq!(outputs.len(), 6);
    }

    #[tokio::test]
    async fn tampered_script_resets_everything_downstream() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let orchestrator =
            Orchestrator::new(Arc::clone(&backend), dir.path(), brief(), OrchestratorSettings::default()).unwrap();
        for stage in UPSTREAM_OF_EDIT {
            orchestrator.drive_stage(stage).await.unwrap();
        }
        std::fs::write(orchestrator.layout().script(), "edited by hand").unwrap();

        let outcome = orchestrator.drive_stage(StageName::Edit).await.unwrap();
        let (stages, files) = match outcome {
            StageOutcome::Invalidated { stages, files } => (stages, files),
            other => panic!("expected invalidation, got {other:?}"),
        };
        assert_eq!(stages, StageName::ALL.to_vec());
        assert_eq!(files, vec![orchestrator.layout().script()]);
        assert!(!orchestrator.layout().audio_file("GIR-1-1").exists());
        assert_eq!(backend.assembles.load(Ordering::SeqCst), 0);
        let state = orchestrator.state();
        for name in ["senaryo", "yonetmen", "varlik_uretimi", SPEECH_OPERATION, "kurgu"] {
            assert_eq!(state.operations[name].status, OperationStatus::NotStarted, "{name}");
        }
    }

    #[tokio::test]
    async fn drift_beyond_the_round_cap_is_fatal() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let settings = OrchestratorSettings {
            max_integrity_rounds: 0,
            cleanup_dirs: Vec::new(),
        };
        let orchestrator = Orchestrator::new(Arc::clone(&backend), dir.path(), brief(), settings).unwrap();
        for stage in UPSTREAM_OF_EDIT {
            orchestrator.drive_stage(stage).await.unwrap();
        }
        std::fs::write(orchestrator.layout().image_file("GIR-1-1"), b"noise").unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::IntegrityNotConverged { rounds: 0 }));
        assert_eq!(backend.assembles.load(Ordering::SeqCst), 0);
        assert!(orchestrator.checkpoint_path().exists());
    }

    #[tokio::test]
    async fn story_naming_files_outside_the_project_is_refused() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            raw_story: Some(
                r#"{"hikaye_yapisi": {"giris": {"bolum_kisaltmasi": "../../../../escape", "paragraflar": [
                    {"paragraf_numarasi": 1, "segmentler": [
                        {"segment_numarasi": 1, "metin": "one", "gorsel_prompt": "a"}]}]}}}"#,
            ),
            ..ScriptedBackend::default()
        });
        let base = dir.path().join("base");
        let orchestrator =
            Orchestrator::new(Arc::clone(&backend), &base, brief(), OrchestratorSettings::default()).unwrap();
        orchestrator.drive_stage(StageName::Scenario).await.unwrap();

        let err = orchestrator.drive_stage(StageName::Direction).await.unwrap_err();
        assert!(err.to_string().contains("abbreviation"), "{err}");
        assert!(!orchestrator.layout().story().exists());
        assert_eq!(
            orchestrator.state().operations["yonetmen"].status,
            OperationStatus::Failed
        );
        let escaped: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("escape"))
            .collect();
        assert!(escaped.is_empty());
        assert_eq!(backend.narrations.load(Ordering::SeqCst), 0);
    }
}
