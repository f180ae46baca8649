use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ImageSink, VisualProvider};
use crate::core::models::GenerationResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StableDiffusionConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_engine_id")]
    pub engine_id: String,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
}

fn default_base_url() -> String {
    "https://api.stability.ai".to_string()
}
fn default_engine_id() -> String {
    "stable-diffusion-xl-1024-v1-0".to_string()
}
fn default_cfg_scale() -> f32 {
    7.0
}
fn default_steps() -> u32 {
    30
}
fn default_dimension() -> u32 {
    1024
}

impl Default for StableDiffusionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            engine_id: default_engine_id(),
            cfg_scale: default_cfg_scale(),
            steps: default_steps(),
            width: default_dimension(),
            height: default_dimension(),
        }
    }
}

#[derive(Serialize)]
struct TextToImageRequest<'a> {
    text_prompts: Vec<TextPrompt<'a>>,
    cfg_scale: f32,
    steps: u32,
    width: u32,
    height: u32,
    samples: u32,
}

#[derive(Serialize)]
struct TextPrompt<'a> {
    text: &'a str,
    weight: f32,
}

#[derive(Deserialize)]
struct TextToImageResponse {
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    base64: Option<String>,
    finish_reason: Option<String>,
}

pub struct StableDiffusionRenderer {
    config: StableDiffusionConfig,
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
    sink: ImageSink,
}

impl StableDiffusionRenderer {
    pub fn new(config: StableDiffusionConfig, api_key: String, sink: ImageSink) -> Result<Self> {
        let endpoint = Url::parse(config.base_url.trim_end_matches('/'))
            .and_then(|u| {
                u.join(&format!(
                    "/v1/generation/{}/text-to-image",
                    config.engine_id
                ))
            })
            .with_context(|| format!("Invalid Stability base url '{}'", config.base_url))?;
        Ok(Self {
            config,
            api_key,
            endpoint,
            client: reqwest::Client::new(),
            sink,
        })
    }

    fn build_request<'a>(&self, prompt: &'a str) -> TextToImageRequest<'a> {
        TextToImageRequest {
            text_prompts: vec![TextPrompt {
                text: prompt,
                weight: 1.0,
            }],
            cfg_scale: self.config.cfg_scale,
            steps: self.config.steps,
            width: self.config.width,
            height: self.config.height,
            samples: 1,
        }
    }

    async fn request_image(&self, prompt: &str) -> Result<Vec<u8>> {
        info!("Generating image with Stable Diffusion ({})...", self.config.engine_id);
        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(&self.build_request(prompt))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Stability API error {}: {}", status, body));
        }

        decode_first_artifact(resp.json().await?)
    }
}

fn decode_first_artifact(body: TextToImageResponse) -> Result<Vec<u8>> {
    let artifact = body
        .artifacts
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Stability API returned no artifacts"))?;
    match artifact.finish_reason.as_deref() {
        Some("CONTENT_FILTERED") => warn!("Stability API filtered the generated image"),
        Some("ERROR") => return Err(anyhow!("Stability API reported a generation error")),
        _ => {}
    }
    let encoded = artifact
        .base64
        .ok_or_else(|| anyhow!("Stability artifact has no image data"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[async_trait]
impl VisualProvider for StableDiffusionRenderer {
    fn name(&self) -> &'static str {
        "stable_diffusion_api"
    }

    async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult {
        let image = self
            .request_image(prompt)
            .await
            .map_err(|e| anyhow!("Error generating Stable Diffusion image: {:#}", e));
        self.sink.persist(output_path, image).await
    }
}
