use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use log::{error, info};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::config::{resolve_api_key, Config};
use crate::core::io::Storage;
use crate::core::models::{CharacterDescription, GenerationResult};

pub mod dalle;
pub mod stable_diffusion;
pub mod vertex;

pub use dalle::{DalleConfig, DalleRenderer};
pub use stable_diffusion::{StableDiffusionConfig, StableDiffusionRenderer};
pub use vertex::{VertexImagenConfig, VertexImagenRenderer};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VisualProviderKind {
    OpenaiDalle,
    #[default]
    GoogleVertexAiImage,
    StableDiffusionApi,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VisualConfig {
    #[serde(default)]
    pub provider: VisualProviderKind,
    #[serde(default)]
    pub openai_dalle: DalleConfig,
    #[serde(default)]
    pub google_vertex_ai_image: VertexImagenConfig,
    #[serde(default)]
    pub stable_diffusion_api: StableDiffusionConfig,
}

/// Image backend: renders a final prompt into an image file.
#[async_trait]
pub trait VisualProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult;
}

/// Writes rendered images through [`Storage`].
#[derive(Clone)]
pub struct ImageSink {
    storage: Arc<dyn Storage>,
}

impl ImageSink {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn persist(&self, output_path: &str, image: Result<Vec<u8>>) -> GenerationResult {
        let result = match image {
            Ok(bytes) if bytes.is_empty() => {
                GenerationResult::failure("Provider returned an empty image")
            }
            Ok(bytes) => match self.storage.write(output_path, &bytes).await {
                Ok(()) => {
                    info!("Image saved to {}", output_path);
                    GenerationResult::success(output_path)
                }
                Err(e) => {
                    GenerationResult::failure(format!("Failed to write {}: {:#}", output_path, e))
                }
            },
            Err(e) => GenerationResult::failure(format!("{:#}", e)),
        };
        if !result.success {
            error!("{}", result.error);
        }
        result
    }
}

/// Builds the per-scene prompt and hands it to the configured provider.
pub struct VisualGenerator {
    provider: Box<dyn VisualProvider>,
}

impl VisualGenerator {
    pub fn new(provider: Box<dyn VisualProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn generate_image(
        &self,
        overall_image_style: &str,
        main_characters: &[CharacterDescription],
        scene_visual_description: &str,
        output_path: &str,
    ) -> GenerationResult {
        let prompt = build_image_prompt(
            overall_image_style,
            main_characters,
            scene_visual_description,
        );
        info!(
            "Generating image for prompt: '{}...'",
            prompt.chars().take(100).collect::<String>()
        );
        self.provider.render(&prompt, output_path).await
    }
}

/// Rewrites every case-insensitive whole-word mention of a character as
/// `"{name} ({appearance})"` and prefixes the overall style.
///
/// All names are matched in a single pass, so a name that happens to occur inside
/// another character's inserted appearance is left alone.
pub fn build_image_prompt(
    overall_image_style: &str,
    main_characters: &[CharacterDescription],
    scene_visual_description: &str,
) -> String {
    let description = expand_character_mentions(main_characters, scene_visual_description);
    let style = overall_image_style.trim();
    if style.is_empty() {
        description
    } else {
        format!("{}, {}", style, description)
    }
}

fn expand_character_mentions(characters: &[CharacterDescription], description: &str) -> String {
    let mut named: Vec<&CharacterDescription> = characters
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .collect();
    if named.is_empty() {
        return description.to_string();
    }
    // prefer "Anna Maria" over "Anna" when both are characters
    named.sort_by(|a, b| b.name.len().cmp(&a.name.len()));

    let alternation = named
        .iter()
        .map(|c| regex::escape(c.name.trim()))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = match Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)) {
        Ok(re) => re,
        Err(e) => {
            error!("Could not build character pattern: {}", e);
            return description.to_string();
        }
    };

    pattern
        .replace_all(description, |caps: &Captures| {
            let matched = caps[0].to_lowercase();
            named
                .iter()
                .find(|c| c.name.trim().to_lowercase() == matched)
                .map(|c| format!("{} ({})", c.name.trim(), c.appearance))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn create_visual_provider(
    config: &Config,
    storage: Arc<dyn Storage>,
) -> Result<Box<dyn VisualProvider>> {
    let sink = ImageSink::new(storage);
    match config.visual.provider {
        VisualProviderKind::OpenaiDalle => {
            let cfg = &config.visual.openai_dalle;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "OPENAI_API_KEY")
                .context("OPENAI_API_KEY not found in config or environment")?;
            info!("OpenAI DALL-E renderer ready ({})", cfg.model);
            Ok(Box::new(DalleRenderer::new(cfg.clone(), api_key, sink)?))
        }
        VisualProviderKind::GoogleVertexAiImage => {
            let cfg = &config.visual.google_vertex_ai_image;
            let project_id = resolve_api_key(cfg.project_id.as_deref(), "GCP_PROJECT_ID")
                .context("GCP_PROJECT_ID not provided. Cannot initialize Vertex AI.")?;
            let access_token = resolve_api_key(cfg.access_token.as_deref(), "GOOGLE_ACCESS_TOKEN")
                .context("GOOGLE_ACCESS_TOKEN not found in config or environment")?;
            info!(
                "Google Vertex AI Imagen model '{}' ready in {}",
                cfg.model_id, cfg.location
            );
            Ok(Box::new(VertexImagenRenderer::new(
                cfg.clone(),
                project_id,
                access_token,
                sink,
            )))
        }
        VisualProviderKind::StableDiffusionApi => {
            let cfg = &config.visual.stable_diffusion_api;
            let api_key = resolve_api_key(cfg.api_key.as_deref(), "STABILITY_API_KEY")
                .context("STABILITY_API_KEY not found in config or environment")?;
            info!("Stable Diffusion renderer ready ({})", cfg.engine_id);
            Ok(Box::new(StableDiffusionRenderer::new(cfg.clone(), api_key, sink)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn characters() -> Vec<CharacterDescription> {
        vec![
            CharacterDescription {
                name: "Nutty".to_string(),
                appearance: "a red squirrel with a blue scarf, friend of Grimble".to_string(),
            },
            CharacterDescription {
                name: "Grimble".to_string(),
                appearance: "an old wizard with a grey beard".to_string(),
            },
        ]
    }

    #[test]
    fn test_prompt_expands_names_case_insensitively() {
        let prompt = build_image_prompt(
            "Watercolor painting",
            &characters(),
            "nutty hides behind GRIMBLE's hat",
        );
        assert_eq!(
            prompt,
            "Watercolor painting, Nutty (a red squirrel with a blue scarf, friend of Grimble) \
             hides behind Grimble (an old wizard with a grey beard)'s hat"
        );
    }

    #[test]
    fn test_prompt_only_matches_whole_words() {
        let prompt = build_image_prompt("", &characters(), "The Nuttyville sign glows");
        assert_eq!(prompt, "The Nuttyville sign glows");
    }

    #[test]
    fn test_prompt_prefers_longest_name() {
        let characters = vec![
            CharacterDescription {
                name: "Anna".to_string(),
                appearance: "short".to_string(),
            },
            CharacterDescription {
                name: "Anna Maria".to_string(),
                appearance: "tall".to_string(),
            },
        ];
        let prompt = build_image_prompt("Style", &characters, "Anna Maria meets Anna");
        assert_eq!(prompt, "Style, Anna Maria (tall) meets Anna (short)");
    }

    #[test]
    fn test_prompt_handles_regex_metacharacters_and_dollar_signs() {
        let characters = vec![CharacterDescription {
            name: "Mr. $mith".to_string(),
            appearance: "wears $1 bills".to_string(),
        }];
        let prompt = build_image_prompt("S", &characters, "mr. $mith waves");
        assert_eq!(prompt, "S, Mr. $mith (wears $1 bills) waves");
    }

    #[derive(Default)]
    struct CapturingProvider {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VisualProvider for Arc<CapturingProvider> {
        fn name(&self) -> &'static str {
            "capture"
        }
        async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult {
            self.prompts.lock().unwrap().push(prompt.to_string());
            GenerationResult::success(output_path)
        }
    }

    #[tokio::test]
    async fn test_generator_sends_final_prompt() {
        let provider = Arc::new(CapturingProvider::default());
        let generator = VisualGenerator::new(Box::new(provider.clone()));
        let result = generator
            .generate_image("Pixel art", &characters(), "Grimble sleeps", "img.png")
            .await;

        assert!(result.success);
        assert_eq!(
            provider.prompts.lock().unwrap()[0],
            "Pixel art, Grimble (an old wizard with a grey beard) sleeps"
        );
    }

    #[tokio::test]
    async fn test_image_sink_failure_has_empty_path() {
        let sink = ImageSink::new(Arc::new(crate::core::io::NativeStorage::new()));
        let result = sink
            .persist("unused.png", Err(anyhow!("content policy violation")))
            .await;
        assert!(!result.success);
        assert!(result.output_path.is_empty());
        assert!(result.error.contains("content policy"));
    }

    #[test]
    fn test_factory_selects_provider() {
        let mut config = Config::default();
        config.visual.provider = VisualProviderKind::StableDiffusionApi;
        config.visual.stable_diffusion_api.api_key = Some("sk".to_string());
        let storage: Arc<dyn Storage> = Arc::new(crate::core::io::NativeStorage::new());
        let provider = create_visual_provider(&config, storage.clone()).unwrap();
        assert_eq!(provider.name(), "stable_diffusion_api");

        config.visual.provider = VisualProviderKind::GoogleVertexAiImage;
        config.visual.google_vertex_ai_image.project_id = Some("proj".to_string());
        config.visual.google_vertex_ai_image.access_token = Some("token".to_string());
        let provider = create_visual_provider(&config, storage).unwrap();
        assert_eq!(provider.name(), "google_vertex_ai_image");
    }
}
