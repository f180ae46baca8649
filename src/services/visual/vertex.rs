use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use log::info;
use serde::{Deserialize, Serialize};

use super::{ImageSink, VisualProvider};
use crate::core::models::GenerationResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VertexImagenConfig {
    pub project_id: Option<String>,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    pub access_token: Option<String>,
}

fn default_location() -> String {
    "us-central1".to_string()
}
fn default_model_id() -> String {
    "imagegeneration@002".to_string()
}

impl Default for VertexImagenConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            location: default_location(),
            model_id: default_model_id(),
            access_token: None,
        }
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PromptInstance<'a>>,
    parameters: PredictParameters,
}

#[derive(Serialize)]
struct PromptInstance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
}

pub struct VertexImagenRenderer {
    config: VertexImagenConfig,
    project_id: String,
    access_token: String,
    client: reqwest::Client,
    sink: ImageSink,
}

impl VertexImagenRenderer {
    pub fn new(
        config: VertexImagenConfig,
        project_id: String,
        access_token: String,
        sink: ImageSink,
    ) -> Self {
        Self {
            config,
            project_id,
            access_token,
            client: reqwest::Client::new(),
            sink,
        }
    }

    fn predict_url(&self) -> String {
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}:predict",
            loc = self.config.location,
            project = self.project_id,
            model = self.config.model_id,
        )
    }

    async fn request_image(&self, prompt: &str) -> Result<Vec<u8>> {
        info!("Generating image with Vertex AI Imagen...");
        let request = PredictRequest {
            instances: vec![PromptInstance { prompt }],
            parameters: PredictParameters { sample_count: 1 },
        };

        let resp = self
            .client
            .post(self.predict_url())
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Vertex AI error {}: {}", status, body));
        }

        decode_first_prediction(resp.json().await?)
    }
}

fn decode_first_prediction(body: PredictResponse) -> Result<Vec<u8>> {
    let encoded = body
        .predictions
        .into_iter()
        .find_map(|p| p.bytes_base64_encoded)
        .ok_or_else(|| anyhow!("Vertex AI returned no images (prompt may have been filtered)"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[async_trait]
impl VisualProvider for VertexImagenRenderer {
    fn name(&self) -> &'static str {
        "google_vertex_ai_image"
    }

    async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult {
        let image = self
            .request_image(prompt)
            .await
            .map_err(|e| anyhow!("Error generating Vertex AI image: {:#}", e));
        self.sink.persist(output_path, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_predict_url() {
        let renderer = VertexImagenRenderer::new(
            VertexImagenConfig::default(),
            "my-project".to_string(),
            "token".to_string(),
            ImageSink::new(Arc::new(crate::core::io::NativeStorage::new())),
        );
        assert_eq!(
            renderer.predict_url(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/my-project/locations/us-central1/publishers/google/models/imagegeneration@002:predict"
        );
    }

    #[test]
    fn test_decode_first_prediction() {
        let body: PredictResponse = serde_json::from_str(
            r#"{"predictions": [{"mimeType": "image/png", "bytesBase64Encoded": "iVBORw=="}]}"#,
        )
        .unwrap();
        assert_eq!(
            decode_first_prediction(body).unwrap(),
            vec![0x89, b'P', b'N', b'G']
        );

        let body: PredictResponse = serde_json::from_str("{}").unwrap();
        assert!(decode_first_prediction(body).is_err());
    }
}
