use crate::core::config::{resolve_api_key, Config};
use crate::services::llm::LlmProvider;
use crate::services::narration::NarrationProviderKind;
use crate::services::visual::VisualProviderKind;
use anyhow::Result;
use inquire::{Password, Text};
use std::path::Path;

/// A credential the selected providers need but neither the config nor the
/// environment supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    GeminiApiKey,
    OpenaiApiKey,
    ElevenLabsApiKey,
    GoogleTtsApiKey,
    DalleApiKey,
    VertexProjectId,
    VertexAccessToken,
    StabilityApiKey,
}

impl Credential {
    pub fn prompt(self) -> &'static str {
        match self {
            Credential::GeminiApiKey => "Google API key (Gemini):",
            Credential::OpenaiApiKey => "OpenAI API key:",
            Credential::ElevenLabsApiKey => "ElevenLabs API key:",
            Credential::GoogleTtsApiKey => "Google API key (Cloud Text-to-Speech):",
            Credential::DalleApiKey => "OpenAI API key (DALL-E):",
            Credential::VertexProjectId => "Google Cloud project id:",
            Credential::VertexAccessToken => "Google Cloud access token (gcloud auth print-access-token):",
            Credential::StabilityApiKey => "Stability AI API key:",
        }
    }

    fn is_secret(self) -> bool {
        !matches!(self, Credential::VertexProjectId)
    }

    /// Stores `value` in the config section this credential belongs to.
    pub fn apply(self, config: &mut Config, value: String) {
        let value = Some(value);
        match self {
            Credential::GeminiApiKey => {
                config.llm.gemini.get_or_insert_with(Default::default).api_key = value
            }
            Credential::OpenaiApiKey => {
                config.llm.openai.get_or_insert_with(Default::default).api_key = value
            }
            Credential::ElevenLabsApiKey => config.narration.elevenlabs.api_key = value,
            Credential::GoogleTtsApiKey => config.narration.google_cloud_tts.api_key = value,
            Credential::DalleApiKey => config.visual.openai_dalle.api_key = value,
            Credential::VertexProjectId => config.visual.google_vertex_ai_image.project_id = value,
            Credential::VertexAccessToken => {
                config.visual.google_vertex_ai_image.access_token = value
            }
            Credential::StabilityApiKey => config.visual.stable_diffusion_api.api_key = value,
        }
    }
}

/// Credentials the currently selected providers cannot resolve.
pub fn missing_credentials(config: &Config) -> Vec<Credential> {
    let mut missing = Vec::new();

    match config.llm.provider {
        LlmProvider::Gemini => {
            let key = config.llm.gemini.as_ref().and_then(|c| c.api_key.as_deref());
            if resolve_api_key(key, "GOOGLE_API_KEY").is_none() {
                missing.push(Credential::GeminiApiKey);
            }
        }
        LlmProvider::Openai => {
            let key = config.llm.openai.as_ref().and_then(|c| c.api_key.as_deref());
            if resolve_api_key(key, "OPENAI_API_KEY").is_none() {
                missing.push(Credential::OpenaiApiKey);
            }
        }
        LlmProvider::Ollama => {}
    }

    match config.narration.provider {
        NarrationProviderKind::Elevenlabs => {
            let key = config.narration.elevenlabs.api_key.as_deref();
            if resolve_api_key(key, "ELEVEN_LABS_API_KEY").is_none() {
                missing.push(Credential::ElevenLabsApiKey);
            }
        }
        NarrationProviderKind::GoogleCloudTts => {
            let key = config.narration.google_cloud_tts.api_key.as_deref();
            if resolve_api_key(key, "GOOGLE_API_KEY").is_none() {
                missing.push(Credential::GoogleTtsApiKey);
            }
        }
    }

    match config.visual.provider {
        VisualProviderKind::OpenaiDalle => {
            let key = config.visual.openai_dalle.api_key.as_deref();
            if resolve_api_key(key, "OPENAI_API_KEY").is_none() {
                missing.push(Credential::DalleApiKey);
            }
        }
        VisualProviderKind::GoogleVertexAiImage => {
            let vertex = &config.visual.google_vertex_ai_image;
            if resolve_api_key(vertex.project_id.as_deref(), "GCP_PROJECT_ID").is_none() {
                missing.push(Credential::VertexProjectId);
            }
            if resolve_api_key(vertex.access_token.as_deref(), "GOOGLE_ACCESS_TOKEN").is_none() {
                missing.push(Credential::VertexAccessToken);
            }
        }
        VisualProviderKind::StableDiffusionApi => {
            let key = config.visual.stable_diffusion_api.api_key.as_deref();
            if resolve_api_key(key, "STABILITY_API_KEY").is_none() {
                missing.push(Credential::StabilityApiKey);
            }
        }
    }

    missing
}

/// Prompts for every missing credential and saves the config when anything changed.
pub fn run_setup(config: &mut Config, config_path: &Path) -> Result<()> {
    let missing = missing_credentials(config);
    if missing.is_empty() {
        return Ok(());
    }

    println!("Some provider credentials are missing.");
    let mut needs_save = false;
    for credential in missing {
        let value = if credential.is_secret() {
            Password::new(credential.prompt())
                .without_confirmation()
                .prompt()?
        } else {
            Text::new(credential.prompt()).prompt()?
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            println!("Skipped.");
            continue;
        }
        credential.apply(config, value);
        needs_save = true;
    }

    if needs_save {
        config.save_to(config_path)?;
        println!("Configuration saved to {}.", config_path.display());
    }
    Ok(())
}
