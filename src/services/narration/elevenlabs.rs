use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{AudioSink, NarrationProvider};
use crate::core::models::GenerationResult;

const ELEVENLABS_API_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
    #[serde(default)]
    pub style: f32,
    #[serde(default = "default_true")]
    pub use_speaker_boost: bool,
}

fn default_voice_id() -> String {
    "21m00Tcm4Fnqa80wBMgs".to_string()
}
fn default_model_id() -> String {
    "eleven_monolingual_v1".to_string()
}
fn default_stability() -> f32 {
    0.7
}
fn default_similarity_boost() -> f32 {
    0.8
}
fn default_true() -> bool {
    true
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: default_voice_id(),
            model_id: default_model_id(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

pub struct ElevenLabsNarrator {
    config: ElevenLabsConfig,
    api_key: String,
    client: reqwest::Client,
    sink: AudioSink,
}

impl ElevenLabsNarrator {
    pub fn new(config: ElevenLabsConfig, api_key: String, sink: AudioSink) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
            sink,
        }
    }

    fn build_request<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
                style: self.config.style,
                use_speaker_boost: self.config.use_speaker_boost,
            },
        }
    }

    async fn request_audio(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", ELEVENLABS_API_URL, self.config.voice_id);

        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("audio/mpeg"));
        headers.insert("xi-api-key", HeaderValue::from_str(&self.api_key)?);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .json(&self.build_request(text))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ElevenLabs API error {}: {}", status, body));
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl NarrationProvider for ElevenLabsNarrator {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, output_path: &str) -> GenerationResult {
        info!(
            "Generating ElevenLabs narration for text: '{}...'",
            text.chars().take(50).collect::<String>()
        );
        let audio = self
            .request_audio(text)
            .await
            .map_err(|e| anyhow!("Error during ElevenLabs narration: {:#}", e));
        let result = self.sink.persist(output_path, audio).await;
        if !result.success {
            error!("{}", result.error);
        }
        result
    }
}
