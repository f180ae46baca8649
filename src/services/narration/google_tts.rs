use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{error, info};
use serde::{Deserialize, Serialize};

use super::{AudioSink, NarrationProvider};
use crate::core::models::GenerationResult;

const GOOGLE_TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GoogleCloudTtsConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    pub voice_name: Option<String>,
    #[serde(default = "default_speaking_rate")]
    pub speaking_rate: f32,
}

fn default_language_code() -> String {
    "en-US".to_string()
}
fn default_speaking_rate() -> f32 {
    1.0
}

impl Default for GoogleCloudTtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            language_code: default_language_code(),
            voice_name: None,
            speaking_rate: default_speaking_rate(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    speaking_rate: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: Option<String>,
}

pub struct GoogleCloudTtsNarrator {
    config: GoogleCloudTtsConfig,
    api_key: String,
    client: reqwest::Client,
    sink: AudioSink,
}

impl GoogleCloudTtsNarrator {
    pub fn new(config: GoogleCloudTtsConfig, api_key: String, sink: AudioSink) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
            sink,
        }
    }

    fn build_request<'a>(&'a self, text: &'a str) -> SynthesizeRequest<'a> {
        SynthesizeRequest {
            input: SynthesisInput { text },
            voice: VoiceSelection {
                language_code: &self.config.language_code,
                name: self.config.voice_name.as_deref(),
            },
            audio_config: AudioConfig {
                audio_encoding: "MP3",
                speaking_rate: self.config.speaking_rate,
            },
        }
    }

    async fn request_audio(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}?key={}", GOOGLE_TTS_URL, self.api_key);
        let resp = self
            .client
            .post(&url)
            .json(&self.build_request(text))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Google Cloud TTS error {}: {}", status, body));
        }

        let body: SynthesizeResponse = resp.json().await?;
        decode_audio_content(body)
    }
}

fn decode_audio_content(body: SynthesizeResponse) -> Result<Vec<u8>> {
    let content = body
        .audio_content
        .ok_or_else(|| anyhow!("Google Cloud TTS response has no audioContent"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(content)?)
}

#[async_trait]
impl NarrationProvider for GoogleCloudTtsNarrator {
    fn name(&self) -> &'static str {
        "google_cloud_tts"
    }

    async fn synthesize(&self, text: &str, output_path: &str) -> GenerationResult {
        info!(
            "Generating Google Cloud TTS narration for: '{}...'",
            text.chars().take(50).collect::<String>()
        );
        let audio = self
            .request_audio(text)
            .await
            .map_err(|e| anyhow!("Error during Google Cloud TTS narration: {:#}", e));
        let result = self.sink.persist(output_path, audio).await;
        if !result.success {
            error!("{}", result.error);
        }
        result
    }
}
