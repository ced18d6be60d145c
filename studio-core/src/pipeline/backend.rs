use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{describe, CommandExecutor, SystemCommandExecutor};
use crate::config::{ChannelProfile, StudioConfig};
use crate::failover::{ClientFactory, FailoverExecutor};
use crate::persist::write_bytes_atomic;
use crate::provider::{GenerativeClient, ImageRequest, SpeechRequest, TextRequest};

use super::error::{PipelineError, PipelineResult};
use super::layout::ProjectLayout;
use super::story::{SegmentAsset, Story};

const SCRIPT_SYSTEM: &str = "You are a scriptwriter for a narrated video channel. \
Write plain narration text only: no headings, no stage directions, no markdown.";

const DIRECTOR_SYSTEM: &str = "You are a video director. Split the narration into sections, \
paragraphs and short segments, and describe one illustration per segment. Answer with JSON only.";

const STORY_SCHEMA: &str = r#"{
  "youtube_bilgileri": {"baslik": "...", "aciklama": "...", "etiketler": ["..."], "seslendirmen": "<voice name>"},
  "hikaye_yapisi": {
    "<section key>": {
      "bolum_kisaltmasi": "<3 letter code>",
      "paragraflar": [
        {"paragraf_numarasi": 1, "segmentler": [
          {"segment_numarasi": 1, "metin": "<narration>", "gorsel_prompt": "<image description>", "en_boy_orani": "16:9"}
        ]}
      ]
    }
  }
}"#;

/// What to produce: one topic for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionBrief {
    pub channel: String,
    pub topic: String,
    pub target_length: usize,
    pub profile: ChannelProfile,
}

impl ProductionBrief {
    pub fn new(channel: impl Into<String>, topic: impl Into<String>, target_length: usize, profile: ChannelProfile) -> Self {
        Self {
            channel: channel.into(),
            topic: topic.into(),
            target_length,
            profile,
        }
    }

    /// Directory-name source for the channel: its configured slug, else its name.
    pub fn channel_slug(&self) -> &str {
        self.profile.slug.as_deref().unwrap_or(&self.channel)
    }
}

/// Everything a stage needs from the outside world.
#[async_trait]
pub trait StageBackend: Send + Sync {
    async fn write_script(&self, brief: &ProductionBrief) -> PipelineResult<String>;
    async fn direct(&self, brief: &ProductionBrief, script: &str) -> PipelineResult<Story>;
    async fn narrate(&self, segment: &SegmentAsset, voice: &str, output: &Path) -> PipelineResult<()>;
    async fn illustrate(&self, segment: &SegmentAsset, output: &Path) -> PipelineResult<()>;
    /// Renders `final_video.mp4` from the story and generated assets.
    async fn assemble(&self, layout: &ProjectLayout) -> PipelineResult<()>;
    async fn upload(&self, layout: &ProjectLayout) -> PipelineResult<()>;
}

/// Command lines of the assembly and upload tools.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalTools {
    pub assemble: Vec<String>,
    pub upload: Vec<String>,
    pub upload_credentials: Vec<PathBuf>,
}

impl ExternalTools {
    pub fn from_config(config: &StudioConfig) -> Self {
        Self {
            assemble: config.tools.assemble.clone(),
            upload: config.tools.upload.clone(),
            upload_credentials: config
                .tools
                .upload_credentials
                .iter()
                .map(|path| config.resolve_path(path))
                .collect(),
        }
    }

    fn credentials(&self) -> Option<&Path> {
        self.upload_credentials
            .iter()
            .find(|path| path.is_file())
            .map(PathBuf::as_path)
    }
}

/// Production backend: AI calls go through the failover executor, assembly
/// and upload are external processes.
pub struct StudioBackend<F: ClientFactory> {
    executor: Arc<FailoverExecutor<F>>,
    tools: ExternalTools,
    commands: Arc<dyn CommandExecutor>,
}

impl<F: ClientFactory> StudioBackend<F> {
    pub fn new(executor: Arc<FailoverExecutor<F>>, tools: ExternalTools) -> Self {
        Self::with_commands(executor, tools, Arc::new(SystemCommandExecutor))
    }

    pub fn with_commands(
        executor: Arc<FailoverExecutor<F>>,
        tools: ExternalTools,
        commands: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            executor,
            tools,
            commands,
        }
    }

    pub fn executor(&self) -> &Arc<FailoverExecutor<F>> {
        &self.executor
    }

    async fn run_tool(&self, tool: &'static str, argv: &[String], args: &[&Path]) -> PipelineResult<()> {
        let (program, rest) = argv
            .split_first()
            .ok_or(PipelineError::ToolNotConfigured { tool })?;
        let mut command = Command::new(program);
        command.args(rest).args(args);
        let line = describe(&command);
        info!(tool, command = %line, "running external tool");

        let output = self
            .commands
            .run(&mut command)
            .await
            .map_err(|source| PipelineError::io(program, source))?;
        if !output.status.success() {
            return Err(PipelineError::Tool {
                tool: line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn script_prompt(brief: &ProductionBrief) -> String {
    let mut prompt = format!(
        "Topic: {}\nChannel: {}\nTarget length: about {} letters.\n",
        brief.topic, brief.channel, brief.target_length
    );
    if let Some(category) = &brief.profile.category {
        prompt.push_str(&format!("Category: {category}\n"));
    }
    if !brief.profile.instruction.is_empty() {
        prompt.push_str(&format!("Channel style: {}\n", brief.profile.instruction));
    }
    prompt.push_str("Write the full narration script.");
    prompt
}

fn direction_prompt(brief: &ProductionBrief, script: &str) -> String {
    format!(
        "Channel: {}\nTopic: {}\nNarrator voice: {}\n\nReturn a JSON document shaped like:\n{}\n\nScript:\n{}",
        brief.channel, brief.topic, brief.profile.voice, STORY_SCHEMA, script
    )
}

#[async_trait]
impl<F> StageBackend for StudioBackend<F>
where
    F: ClientFactory,
    F::Client: GenerativeClient,
{
    async fn write_script(&self, brief: &ProductionBrief) -> PipelineResult<String> {
        let request = TextRequest::new(script_prompt(brief)).with_system(SCRIPT_SYSTEM);
        let script = self.executor.generate_text(request).await?;
        let script = script.trim().to_string();
        if script.is_empty() {
            return Err(PipelineError::Story("scriptwriter returned empty text".into()));
        }
        Ok(script)
    }

    async fn direct(&self, brief: &ProductionBrief, script: &str) -> PipelineResult<Story> {
        let request = TextRequest::new(direction_prompt(brief, script))
            .with_system(DIRECTOR_SYSTEM)
            .json();
        let raw = self.executor.generate_text(request).await?;
        Story::parse(&raw)
    }

    async fn narrate(&self, segment: &SegmentAsset, voice: &str, output: &Path) -> PipelineResult<()> {
        let request = SpeechRequest {
            text: segment.text.clone(),
            voice: voice.to_string(),
        };
        let clip = self.executor.synthesize_speech(request).await?;
        let wav = clip.to_wav_bytes()?;
        write_bytes_atomic(output, &wav).map_err(|source| PipelineError::io(output, source))?;
        debug!(segment = %segment.stem, path = %output.display(), samples = clip.samples.len(), "narration written");
        Ok(())
    }

    async fn illustrate(&self, segment: &SegmentAsset, output: &Path) -> PipelineResult<()> {
        let request = ImageRequest {
            prompt: segment.image_prompt.clone(),
            aspect_ratio: segment.aspect_ratio,
        };
        let png = self.executor.generate_image(request).await?;
        write_bytes_atomic(output, &png).map_err(|source| PipelineError::io(output, source))?;
        debug!(segment = %segment.stem, path = %output.display(), bytes = png.len(), "illustration written");
        Ok(())
    }

    async fn assemble(&self, layout: &ProjectLayout) -> PipelineResult<()> {
        let story = layout.story();
        let audio = layout.audio_dir();
        let images = layout.image_dir();
        let video = layout.final_video();
        self.run_tool("assemble", &self.tools.assemble, &[&story, &audio, &images, &video])
            .await
    }

    async fn upload(&self, layout: &ProjectLayout) -> PipelineResult<()> {
        let Some(credentials) = self.tools.credentials() else {
            return Err(PipelineError::MissingUploadCredentials {
                candidates: self.tools.upload_credentials.clone(),
            });
        };
        debug!(path = %credentials.display(), "using upload credentials");
        let video = layout.final_video();
        let story = layout.story();
        self.run_tool("upload", &self.tools.upload, &[&video, &story]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_brief_details() {
        let profile = ChannelProfile {
            instruction: "calm and curious".into(),
            category: Some("Science & Technology".into()),
            ..ChannelProfile::default()
        };
        let brief = ProductionBrief::new("Tech Daily", "Tech AI Trends", 1500, profile);
        let prompt = script_prompt(&brief);
        assert!(prompt.contains("Tech AI Trends"));
        assert!(prompt.contains("1500"));
        assert!(prompt.contains("calm and curious"));
        assert!(direction_prompt(&brief, "Once upon a time").contains("bolum_kisaltmasi"));
        assert_eq!(brief.channel_slug(), "Tech Daily");
    }

    #[test]
    fn credentials_resolve_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::parse_studio_config("").unwrap();
        config.system.base_dir = dir.path().display().to_string();
        let tools = ExternalTools::from_config(&config);
        assert!(tools.credentials().is_none());
        std::fs::write(dir.path().join("credentials.json"), "{}").unwrap();
        assert_eq!(tools.credentials(), Some(dir.path().join("credentials.json").as_path()));
    }
}
