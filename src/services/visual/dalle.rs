use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ImageSink, VisualProvider};
use crate::core::models::GenerationResult;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DalleQuality {
    #[default]
    Standard,
    Hd,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DalleConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default)]
    pub quality: DalleQuality,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "dall-e-3".to_string()
}
fn default_size() -> String {
    "1024x1024".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

impl Default for DalleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            size: default_size(),
            quality: DalleQuality::default(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    quality: DalleQuality,
    n: u32,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

pub struct DalleRenderer {
    config: DalleConfig,
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
    sink: ImageSink,
}

impl DalleRenderer {
    pub fn new(config: DalleConfig, api_key: String, sink: ImageSink) -> Result<Self> {
        let endpoint = generations_endpoint(&config.base_url)?;
        Ok(Self {
            config,
            api_key,
            endpoint,
            client: reqwest::Client::new(),
            sink,
        })
    }

    async fn request_image(&self, prompt: &str) -> Result<Vec<u8>> {
        info!("Generating image with {}...", self.config.model);
        let request = ImageRequest {
            model: &self.config.model,
            prompt,
            size: &self.config.size,
            quality: self.config.quality,
            n: 1,
        };

        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI images API error {}: {}", status, body));
        }

        let body: ImageResponse = resp.json().await?;
        let image_url = first_image_url(body)?;

        let image = self.client.get(&image_url).send().await?.error_for_status()?;
        Ok(image.bytes().await?.to_vec())
    }
}

fn generations_endpoint(base_url: &str) -> Result<Url> {
    let mut base = base_url.trim_end_matches('/').to_string();
    base.push('/');
    Url::parse(&base)
        .and_then(|u| u.join("images/generations"))
        .with_context(|| format!("Invalid OpenAI base url '{}'", base_url))
}

fn first_image_url(body: ImageResponse) -> Result<String> {
    body.data
        .into_iter()
        .next()
        .and_then(|d| d.url)
        .ok_or_else(|| anyhow!("OpenAI images response contained no image url"))
}

#[async_trait]
impl VisualProvider for DalleRenderer {
    fn name(&self) -> &'static str {
        "openai_dalle"
    }

    async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult {
        let image = self
            .request_image(prompt)
            .await
            .map_err(|e| anyhow!("Error generating DALL-E image: {:#}", e));
        self.sink.persist(output_path, image).await
    }
}
