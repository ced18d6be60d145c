use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::config::placeholder_name;

use super::error::{ProviderError, ProviderResult};
use super::{Capability, ProviderConfig, ProviderKind};

pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/";
const OPENAI_BASE: &str = "https://api.openai.com/v1/";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1/";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 8192;
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the model for a bare JSON document.
    pub json_output: bool,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            json_output: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AspectRatio {
    Square,
    Landscape,
    Portrait,
    #[default]
    Wide,
    Tall,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "4:3",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1:1" => Ok(AspectRatio::Square),
            "4:3" => Ok(AspectRatio::Landscape),
            "3:4" => Ok(AspectRatio::Portrait),
            "16:9" => Ok(AspectRatio::Wide),
            "9:16" => Ok(AspectRatio::Tall),
            other => Err(format!("unknown aspect ratio: {other}")),
        }
    }
}

// Unknown ratios fall back to 16:9 rather than rejecting the whole story.
impl From<String> for AspectRatio {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.as_str().to_string()
    }
}

/// Mono 16-bit PCM as returned by the speech endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechClip {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl SpeechClip {
    pub fn from_pcm_le(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn to_wav_bytes(&self) -> ProviderResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buffer, spec)?;
            for sample in &self.samples {
                writer.write_sample(*sample)?;
            }
            writer.finalize()?;
        }
        Ok(buffer.into_inner())
    }
}

/// Re-encodes any supported image payload as PNG.
pub fn normalize_png(bytes: &[u8]) -> ProviderResult<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let mut out = Cursor::new(Vec::new());
    decoded.write_to(&mut out, image::ImageOutputFormat::Png)?;
    Ok(out.into_inner())
}

pub fn openai_voice(voice: &str) -> &'static str {
    match voice {
        "Aoede" | "Fenrir" => "nova",
        "Kore" => "alloy",
        "Leda" => "echo",
        "Zephyr" => "fable",
        "Puck" | "Orus" => "onyx",
        "Charon" => "shimmer",
        _ => "alloy",
    }
}

pub fn openai_image_size(ratio: AspectRatio) -> &'static str {
    match ratio {
        AspectRatio::Wide => "1792x1024",
        AspectRatio::Tall => "1024x1792",
        _ => "1024x1024",
    }
}

#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn generate_text(&self, request: &TextRequest) -> ProviderResult<String>;
    async fn synthesize_speech(&self, request: &SpeechRequest) -> ProviderResult<SpeechClip>;
    /// Returns PNG bytes.
    async fn generate_image(&self, request: &ImageRequest) -> ProviderResult<Vec<u8>>;
}

/// HTTP client for one provider configuration.
pub struct ProviderClient {
    http: reqwest::Client,
    config: Arc<ProviderConfig>,
    credential: String,
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClient")
            .field("key", &self.config.key)
            .field("kind", &self.config.kind)
            .finish()
    }
}

impl ProviderClient {
    pub fn new(config: Arc<ProviderConfig>) -> ProviderResult<Self> {
        Self::with_lookup(config, |name| std::env::var(name).ok())
    }

    /// Builds the client, resolving a `${NAME}` credential through `lookup`.
    pub fn with_lookup<F>(config: Arc<ProviderConfig>, lookup: F) -> ProviderResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credential = match placeholder_name(&config.credential) {
            Some(name) => lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ProviderError::MissingCredential {
                    key: config.key.clone(),
                    name: name.to_string(),
                })?,
            None => config.credential.clone(),
        };
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            credential,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn model(&self, capability: Capability) -> ProviderResult<&str> {
        if !self.config.kind.supports(capability) {
            return Err(ProviderError::Unsupported {
                kind: self.config.kind,
                capability,
            });
        }
        self.config
            .model(capability)
            .ok_or_else(|| ProviderError::MissingModel {
                key: self.config.key.clone(),
                capability,
            })
    }

    fn endpoint(&self, path: &str) -> ProviderResult<Url> {
        let default = match self.config.kind {
            ProviderKind::Gemini => GEMINI_BASE,
            ProviderKind::OpenAi => OPENAI_BASE,
            ProviderKind::Anthropic => ANTHROPIC_BASE,
        };
        let mut base = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Url::parse(&base)?.join(path)?)
    }

    async fn post_json(&self, path: &str, body: &Value) -> ProviderResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        debug!(provider = %self.config.key, %url, "sending provider request");
        let builder = self.http.post(url).json(body);
        let builder = match self.config.kind {
            ProviderKind::Gemini => builder.header("x-goog-api-key", &self.credential),
            ProviderKind::OpenAi => builder.bearer_auth(&self.credential),
            ProviderKind::Anthropic => builder
                .header("x-api-key", &self.credential)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };
        check_status(builder.send().await?).await
    }

    async fn gemini_generate(&self, model: &str, body: Value) -> ProviderResult<Value> {
        let path = format!("models/{model}:generateContent");
        Ok(self.post_json(&path, &body).await?.json::<Value>().await?)
    }
}

async fn check_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(ProviderError::Quota {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn gemini_parts(response: &Value) -> ProviderResult<&Vec<Value>> {
    response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Decode("gemini response has no content parts".into()))
}

fn joined_text<'a, I>(parts: I) -> Option<String>
where
    I: Iterator<Item = &'a str>,
{
    let text: String = parts.collect();
    (!text.trim().is_empty()).then_some(text)
}

#[async_trait]
impl GenerativeClient for ProviderClient {
    async fn generate_text(&self, request: &TextRequest) -> ProviderResult<String> {
        let model = self.model(Capability::Text)?;
        match self.config.kind {
            ProviderKind::Gemini => {
                let mut body = json!({
                    "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
                });
                if let Some(system) = &request.system {
                    body["systemInstruction"] = json!({"parts": [{"text": system}]});
                }
                if request.json_output {
                    body["generationConfig"] = json!({"responseMimeType": "application/json"});
                }
                let response = self.gemini_generate(model, body).await?;
                let parts = gemini_parts(&response)?;
                joined_text(parts.iter().filter_map(|part| part["text"].as_str()))
                    .ok_or_else(|| ProviderError::Decode("gemini returned empty text".into()))
            }
            ProviderKind::OpenAi => {
                let mut messages = Vec::new();
                if let Some(system) = &request.system {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.push(json!({"role": "user", "content": request.prompt}));
                let mut body = json!({"model": model, "messages": messages});
                if request.json_output {
                    body["response_format"] = json!({"type": "json_object"});
                }
                let response: Value = self
                    .post_json("chat/completions", &body)
                    .await?
                    .json()
                    .await?;
                response
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ProviderError::Decode("openai returned no message".into()))
            }
            ProviderKind::Anthropic => {
                let mut system = request.system.clone().unwrap_or_default();
                if request.json_output {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str("Respond with a single JSON document and nothing else.");
                }
                let mut body = json!({
                    "model": model,
                    "max_tokens": ANTHROPIC_MAX_TOKENS,
                    "messages": [{"role": "user", "content": request.prompt}],
                });
                if !system.is_empty() {
                    body["system"] = json!(system);
                }
                let response: Value = self.post_json("messages", &body).await?.json().await?;
                let blocks = response["content"]
                    .as_array()
                    .ok_or_else(|| ProviderError::Decode("anthropic returned no content".into()))?;
                joined_text(
                    blocks
                        .iter()
                        .filter(|block| block["type"] == "text")
                        .filter_map(|block| block["text"].as_str()),
                )
                .ok_or_else(|| ProviderError::Decode("anthropic returned empty text".into()))
            }
        }
    }

    async fn synthesize_speech(&self, request: &SpeechRequest) -> ProviderResult<SpeechClip> {
        let model = self.model(Capability::Speech)?;
        match self.config.kind {
            ProviderKind::Gemini => {
                let body = json!({
                    "contents": [{"parts": [{"text": request.text}]}],
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": request.voice}}
                        }
                    }
                });
                let response = self.gemini_generate(model, body).await?;
                let encoded = gemini_parts(&response)?
                    .iter()
                    .find_map(|part| part.pointer("/inlineData/data").and_then(Value::as_str))
                    .ok_or_else(|| ProviderError::Decode("gemini returned no audio".into()))?;
                let pcm = BASE64.decode(encoded)?;
                Ok(SpeechClip::from_pcm_le(&pcm, SPEECH_SAMPLE_RATE))
            }
            ProviderKind::OpenAi => {
                let body = json!({
                    "model": model,
                    "input": request.text,
                    "voice": openai_voice(&request.voice),
                    "response_format": "pcm",
                });
                let pcm = self.post_json("audio/speech", &body).await?.bytes().await?;
                Ok(SpeechClip::from_pcm_le(&pcm, SPEECH_SAMPLE_RATE))
            }
            ProviderKind::Anthropic => Err(ProviderError::Unsupported {
                kind: self.config.kind,
                capability: Capability::Speech,
            }),
        }
    }

    async fn generate_image(&self, request: &ImageRequest) -> ProviderResult<Vec<u8>> {
        let model = self.model(Capability::Image)?;
        let encoded = match self.config.kind {
            ProviderKind::Gemini => {
                let body = json!({
                    "instances": [{"prompt": request.prompt}],
                    "parameters": {"sampleCount": 1, "aspectRatio": request.aspect_ratio.as_str()},
                });
                let path = format!("models/{model}:predict");
                let response: Value = self.post_json(&path, &body).await?.json().await?;
                response
                    .pointer("/predictions/0/bytesBase64Encoded")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ProviderError::Decode("gemini returned no image".into()))?
            }
            ProviderKind::OpenAi => {
                let body = json!({
                    "model": model,
                    "prompt": request.prompt,
                    "n": 1,
                    "size": openai_image_size(request.aspect_ratio),
                    "response_format": "b64_json",
                });
                let response: Value = self
                    .post_json("images/generations", &body)
                    .await?
                    .json()
                    .await?;
                response
                    .pointer("/data/0/b64_json")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ProviderError::Decode("openai returned no image".into()))?
            }
            ProviderKind::Anthropic => {
                return Err(ProviderError::Unsupported {
                    kind: self.config.kind,
                    capability: Capability::Image,
                })
            }
        };
        normalize_png(&BASE64.decode(encoded)?)
    }
}
