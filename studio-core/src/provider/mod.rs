pub mod client;
pub mod error;
pub mod registry;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;

pub use client::{
    normalize_png, openai_image_size, openai_voice, AspectRatio, GenerativeClient, ImageRequest,
    ProviderClient, SpeechClip, SpeechRequest, TextRequest,
};
pub use error::{ProviderError, ProviderResult};
pub use registry::ProviderRegistry;

pub const DEFAULT_PRIORITY: u32 = 999;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "tts")]
    Speech,
    #[serde(rename = "image")]
    Image,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Text, Capability::Speech, Capability::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Speech => "tts",
            Capability::Image => "image",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Capability::Text),
            "tts" | "speech" => Ok(Capability::Speech),
            "image" => Ok(Capability::Image),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Guesses the kind from a provider table name such as `gemini` or `openai_eu`.
    pub fn infer(name: &str) -> Option<Self> {
        let lowered = name.to_lowercase();
        if lowered.contains("gemini") || lowered.contains("google") {
            Some(ProviderKind::Gemini)
        } else if lowered.contains("openai") || lowered.contains("gpt") {
            Some(ProviderKind::OpenAi)
        } else if lowered.contains("anthropic") || lowered.contains("claude") {
            Some(ProviderKind::Anthropic)
        } else {
            None
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match self {
            ProviderKind::Gemini | ProviderKind::OpenAi => true,
            ProviderKind::Anthropic => capability == Capability::Text,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one named configuration of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    pub provider: String,
    pub config_name: String,
}

impl ProviderKey {
    pub fn new(provider: impl Into<String>, config_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            config_name: config_name.into(),
        }
    }

    /// Key used in the persisted usage ledger.
    pub fn ledger_key(&self) -> String {
        format!("{}_{}", self.provider, self.config_name)
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.config_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapabilityModels {
    pub text: Option<String>,
    pub speech: Option<String>,
    pub image: Option<String>,
}

impl CapabilityModels {
    pub fn get(&self, capability: Capability) -> Option<&str> {
        let model = match capability {
            Capability::Text => self.text.as_deref(),
            Capability::Speech => self.speech.as_deref(),
            Capability::Image => self.image.as_deref(),
        };
        model.filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub key: ProviderKey,
    pub kind: ProviderKind,
    pub models: CapabilityModels,
    pub priority: u32,
    pub daily_quota: Option<u64>,
    pub cost_per_request: f64,
    #[serde(skip)]
    pub credential: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl ProviderConfig {
    /// Builds a config from its settings table. Returns `None` when the kind
    /// can be neither read nor inferred.
    pub fn from_settings(provider: &str, config_name: &str, settings: &ProviderSettings) -> Option<Self> {
        let kind = settings.kind.or_else(|| ProviderKind::infer(provider))?;
        Some(Self {
            key: ProviderKey::new(provider, config_name),
            kind,
            models: CapabilityModels {
                text: settings.model_text.clone(),
                speech: settings.model_tts.clone(),
                image: settings.model_image.clone(),
            },
            priority: settings.priority.unwrap_or(DEFAULT_PRIORITY),
            daily_quota: settings.daily_quota,
            cost_per_request: settings.cost_per_request,
            credential: settings.api_key.clone().unwrap_or_default(),
            base_url: settings.base_url.clone(),
            timeout: settings
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    pub fn model(&self, capability: Capability) -> Option<&str> {
        self.models.get(capability)
    }

    pub fn has_credential(&self) -> bool {
        !self.credential.trim().is_empty()
    }

    /// Whether this pair can serve `capability`.
    pub fn serves(&self, capability: Capability) -> bool {
        self.kind.supports(capability) && self.model(capability).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_inference_follows_provider_name() {
        assert_eq!(ProviderKind::infer("gemini"), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::infer("OpenAI_eu"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::infer("claude"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::infer("local"), None);
    }

    #[test]
    fn blank_models_do_not_count() {
        let settings = ProviderSettings {
            api_key: Some("k".into()),
            model_text: Some("  ".into()),
            model_image: Some("dall-e-3".into()),
            ..ProviderSettings::default()
        };
        let config = ProviderConfig::from_settings("openai", "default", &settings).unwrap();
        assert!(!config.serves(Capability::Text));
        assert!(config.serves(Capability::Image));
        assert_eq!(config.priority, DEFAULT_PRIORITY);
        assert_eq!(config.key.ledger_key(), "openai_default");
    }
}
