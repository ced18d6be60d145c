use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::Weekday;
use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::ordered::OrderedMap;
use crate::provider::ProviderKind;

pub const ENV_PREFIX: &str = "STUDIO_";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StudioConfig {
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub failover: FailoverSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub providers: OrderedMap<OrderedMap<ProviderSettings>>,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelProfile>,
    #[serde(default)]
    pub daily_tasks: BTreeMap<String, DailyTask>,
}

impl StudioConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.system.base_dir).join(path)
        }
    }

    pub fn usage_path(&self) -> PathBuf {
        self.resolve_path(&self.system.usage_file)
    }

    /// Profile for `channel`; unknown channels get the default profile.
    pub fn channel(&self, channel: &str) -> ChannelProfile {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    pub fn daily_task(&self, weekday: Weekday) -> Option<&DailyTask> {
        self.daily_tasks.get(weekday_key(weekday))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (day, task) in &self.daily_tasks {
            if parse_weekday(day).is_none() {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    message: format!("daily_tasks.{day} is not a weekday"),
                });
            }
            if task.topic.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    message: format!("daily_tasks.{day} has an empty topic"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_usage_file")]
    pub usage_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            usage_file: default_usage_file(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverSection {
    #[serde(default = "default_max_retry")]
    pub max_retry_per_api: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub jitter_seconds: u64,
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            max_retry_per_api: default_max_retry(),
            retry_delay_seconds: default_retry_delay(),
            jitter_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_integrity_rounds")]
    pub max_integrity_rounds: usize,
    #[serde(default = "default_cleanup_dirs")]
    pub cleanup_dirs: Vec<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_integrity_rounds: default_integrity_rounds(),
            cleanup_dirs: default_cleanup_dirs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default)]
    pub assemble: Vec<String>,
    #[serde(default)]
    pub upload: Vec<String>,
    #[serde(default = "default_upload_credentials")]
    pub upload_credentials: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            assemble: Vec::new(),
            upload: Vec::new(),
            upload_credentials: default_upload_credentials(),
        }
    }
}

/// One named configuration of a provider, e.g. `[providers.gemini.primary]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub kind: Option<ProviderKind>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_text: Option<String>,
    #[serde(default)]
    pub model_tts: Option<String>,
    #[serde(default)]
    pub model_image: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub daily_quota: Option<u64>,
    #[serde(default)]
    pub cost_per_request: f64,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChannelProfile {
    #[serde(default)]
    pub instruction: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl Default for ChannelProfile {
    fn default() -> Self {
        Self {
            instruction: String::new(),
            voice: default_voice(),
            category: None,
            slug: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DailyTask {
    pub channel: String,
    pub topic: String,
    #[serde(default = "default_target_length")]
    pub target_length: usize,
}

fn default_base_dir() -> String {
    ".".into()
}

fn default_usage_file() -> String {
    "api_usage.json".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_max_retry() -> usize {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_integrity_rounds() -> usize {
    2
}

fn default_cleanup_dirs() -> Vec<String> {
    vec![".cache".into(), "temp_clips".into(), "temp".into()]
}

fn default_upload_credentials() -> Vec<String> {
    vec!["service_account.json".into(), "credentials.json".into()]
}

fn default_voice() -> String {
    "Kore".into()
}

fn default_target_length() -> usize {
    1500
}

pub fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn parse_weekday(key: &str) -> Option<Weekday> {
    Weekday::from_str(key).ok()
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
    })
}

/// Replaces `${NAME}` placeholders using `lookup`. Unknown names are kept
/// verbatim so that a missing secret surfaces later, at request time.
pub fn substitute_env<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env_pattern()
        .replace_all(content, |caps: &Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => {
                    warn!(variable = name, "environment variable not set; keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Extracts the variable name when `value` is exactly one `${NAME}` placeholder.
pub fn placeholder_name(value: &str) -> Option<&str> {
    let caps = env_pattern().captures(value)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == value.len() {
        caps.get(1).map(|name| name.as_str())
    } else {
        None
    }
}

pub fn apply_env_overrides<F>(config: &mut StudioConfig, path: &Path, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
    if let Some(level) = var("LOG_LEVEL") {
        config.system.log_level = level;
    }
    if let Some(base_dir) = var("BASE_DIR") {
        config.system.base_dir = base_dir;
    }
    if let Some(usage_file) = var("USAGE_FILE") {
        config.system.usage_file = usage_file;
    }
    if let Some(raw) = var("MAX_RETRY") {
        config.failover.max_retry_per_api = parse_override(path, "MAX_RETRY", &raw)?;
    }
    if let Some(raw) = var("RETRY_DELAY") {
        config.failover.retry_delay_seconds = parse_override(path, "RETRY_DELAY", &raw)?;
    }
    Ok(())
}

fn parse_override<T: FromStr>(path: &Path, name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        path: path.to_path_buf(),
        message: format!("{ENV_PREFIX}{name}={raw} is not a valid number"),
    })
}

pub fn load_studio_config<P: AsRef<Path>>(path: P) -> Result<StudioConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let lookup = |name: &str| std::env::var(name).ok();
    let mut config = parse_toml::<StudioConfig>(&substitute_env(&content, lookup), path)?;
    apply_env_overrides(&mut config, path, lookup)?;
    config.validate(path)?;
    Ok(config)
}

/// Parses an in-memory document without environment handling.
pub fn parse_studio_config(content: &str) -> Result<StudioConfig> {
    let path = Path::new("<inline>");
    let config = parse_toml::<StudioConfig>(content, path)?;
    config.validate(path)?;
    Ok(config)
}

fn parse_toml<T>(content: &str, path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/studio.toml");
        let config = load_studio_config(path).expect("config should parse");
        assert_eq!(config.failover.max_retry_per_api, 3);
        let providers: Vec<_> = config.providers.iter().map(|(name, _)| name).collect();
        assert_eq!(providers, vec!["gemini", "openai", "anthropic"]);
        let gemini = config.providers.get("gemini").unwrap();
        assert_eq!(gemini.len(), 2);
        assert!(config.daily_task(Weekday::Mon).is_some());
        assert_eq!(config.channel("Tech Daily").voice, "Puck");
    }

    #[test]
    fn substitutes_known_and_keeps_unknown_placeholders() {
        let out = substitute_env("a=${KNOWN} b=${MISSING}", |name| {
            (name == "KNOWN").then(|| "value".to_string())
        });
        assert_eq!(out, "a=value b=${MISSING}");
    }

    #[test]
    fn placeholder_name_requires_whole_value() {
        assert_eq!(placeholder_name("${OPENAI_KEY}"), Some("OPENAI_KEY"));
        assert_eq!(placeholder_name("prefix-${OPENAI_KEY}"), None);
        assert_eq!(placeholder_name("sk-live"), None);
    }

    #[test]
    fn env_overrides_replace_sections() {
        let mut config = parse_studio_config("").unwrap();
        let path = Path::new("studio.toml");
        apply_env_overrides(&mut config, path, |name| match name {
            "STUDIO_MAX_RETRY" => Some("5".into()),
            "STUDIO_LOG_LEVEL" => Some("debug".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.failover.max_retry_per_api, 5);
        assert_eq!(config.system.log_level, "debug");
        assert_eq!(config.failover.retry_delay_seconds, 5);

        let err = apply_env_overrides(&mut config, path, |name| {
            (name == "STUDIO_RETRY_DELAY").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn missing_tools_table_keeps_credential_defaults() {
        let config = parse_studio_config("").unwrap();
        assert_eq!(
            config.tools.upload_credentials,
            vec!["service_account.json", "credentials.json"]
        );
        let partial = parse_studio_config("[tools]\nassemble = [\"python3\"]\n").unwrap();
        assert_eq!(partial.tools.upload_credentials, config.tools.upload_credentials);
    }

    #[test]
    fn rejects_unknown_weekday() {
        let err = parse_studio_config(
            "[daily_tasks.someday]\nchannel = \"x\"\ntopic = \"y\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
