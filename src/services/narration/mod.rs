use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::core::config::{resolve_api_key, Config};
use crate::core::io::Storage;
use crate::core::models::GenerationResult;
use crate::utils::audio::probe_duration;

pub mod elevenlabs;
pub mod google_tts;

pub use elevenlabs::{ElevenLabsConfig, ElevenLabsNarrator};
pub use google_tts::{GoogleCloudTtsConfig, GoogleCloudTtsNarrator};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NarrationProviderKind {
    #[default]
    Elevenlabs,
    GoogleCloudTts,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NarrationConfig {
    #[serde(default)]
    pub provider: NarrationProviderKind,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
    #[serde(default)]
    pub google_cloud_tts: GoogleCloudTtsConfig,
}

/// Text-to-speech backend. Every call yields a [`GenerationResult`] whose `duration`
/// is set on success; failures never escape as errors.
#[async_trait]
pub trait NarrationProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn synthesize(&self, text: &str, output_path: &str) -> GenerationResult;
}

/// Writes synthesized audio and measures it.
#[derive(Clone)]
pub struct AudioSink {
    storage: Arc<dyn Storage>,
    ffprobe: String,
}

impl AudioSink {
    pub fn new(storage: Arc<dyn Storage>, ffprobe: impl Into<String>) -> Self {
        Self {
            storage,
            ffprobe: ffprobe.into(),
        }
    }

    pub async fn persist(&self, output_path: &str, audio: Result<Vec<u8>>) -> GenerationResult {
        let bytes = match audio {
            Ok(bytes) if bytes.is_empty() => {
                return GenerationResult::failure("Provider returned empty audio")
            }
            Ok(bytes) => bytes,
            Err(e) => return GenerationResult::failure(format!("{:#}", e)),
        };

        if let Err(e) = self.storage.write(output_path, &bytes).await {
            return GenerationResult::failure(format!("Failed to write {}: {:#}", output_path, e));
        }
        info!("Narration saved to {}", output_path);

        let duration = match probe_duration(&self.ffprobe, Path::new(output_path)).await {
            Ok(d) => d,
            Err(e) => {
                error!("Error getting audio duration for {}: {:#}", output_path, e);
                0.0
            }
        };
        GenerationResult::success(output_path).with_duration(duration)
    }
}

pub fn create_narration_provider(
    config: &Config,
    storage: Arc<dyn Storage>,
) -> Result<Box<dyn NarrationProvider>> {
    let sink = AudioSink::new(storage, config.video.ffprobe_path.clone());
    match config.narration.provider {
        NarrationProviderKind::Elevenlabs => {
            let cfg = &config.narration.elevenlabs;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "ELEVEN_LABS_API_KEY")
                .context("ELEVEN_LABS_API_KEY not found in config or environment")?;
            info!("ElevenLabs narration ready (voice {})", cfg.voice_id);
            Ok(Box::new(ElevenLabsNarrator::new(cfg.clone(), api_key, sink)))
        }
        NarrationProviderKind::GoogleCloudTts => {
            let cfg = &config.narration.google_cloud_tts;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "GOOGLE_API_KEY")
                .context("GOOGLE_API_KEY not found in config or environment")?;
            info!("Google Cloud TTS narration ready ({})", cfg.language_code);
            Ok(Box::new(GoogleCloudTtsNarrator::new(cfg.clone(), api_key, sink)))
        }
    }
}
