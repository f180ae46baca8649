use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::llm::LlmConfig;
use crate::services::narration::NarrationConfig;
use crate::services::visual::VisualConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_subject")]
    pub story_subject: String,

    #[serde(default = "default_num_scenes")]
    pub num_scenes: usize,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub narration: NarrationConfig,

    #[serde(default)]
    pub visual: VisualConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_base_folder")]
    pub base_folder: String,
    #[serde(default = "default_video_filename")]
    pub video_filename: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_transition")]
    pub image_transition_duration: f64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound on in-flight per-scene generator calls. 1 keeps the stages fully sequential.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreKind {
    #[default]
    Memory,
    Json,
}

impl StateStoreKind {
    /// Whether lifecycle history outlives the process that recorded it.
    pub fn is_persistent(self) -> bool {
        matches!(self, StateStoreKind::Json)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub store: StateStoreKind,
    #[serde(default = "default_state_path")]
    pub path: String,
}

/// Resolved output folders for one configuration.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    pub base: PathBuf,
    pub audios: PathBuf,
    pub images: PathBuf,
    pub videos: PathBuf,
}

fn default_subject() -> String {
    "A mischievous squirrel trying to steal a giant acorn from a grumpy wizard's garden."
        .to_string()
}
fn default_num_scenes() -> usize {
    4
}
fn default_base_folder() -> String {
    "shortfactory_output".to_string()
}
fn default_video_filename() -> String {
    "final_video.mp4".to_string()
}
fn default_transition() -> f64 {
    0.5
}
fn default_fps() -> u32 {
    24
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}
fn default_max_concurrency() -> usize {
    1
}
fn default_max_retries() -> usize {
    3
}
fn default_state_path() -> String {
    "shortfactory_output/state.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            story_subject: default_subject(),
            num_scenes: default_num_scenes(),
            unattended: false,
            output: OutputConfig::default(),
            llm: LlmConfig::default(),
            narration: NarrationConfig::default(),
            visual: VisualConfig::default(),
            video: VideoConfig::default(),
            pipeline: PipelineConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_folder: default_base_folder(),
            video_filename: default_video_filename(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            image_transition_duration: default_transition(),
            fps: default_fps(),
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            store: StateStoreKind::default(),
            path: default_state_path(),
        }
    }
}

impl Config {
    /// Reads the YAML config at `path`. A missing file yields the defaults so that a
    /// run driven purely by environment variables still works.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("{} not found, using default configuration", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn output_dirs(&self) -> OutputDirs {
        let base = PathBuf::from(&self.output.base_folder);
        OutputDirs {
            audios: base.join("story_audios"),
            images: base.join("story_images"),
            videos: base.join("final_videos"),
            base,
        }
    }

    pub fn ensure_directories(&self) -> Result<OutputDirs> {
        let dirs = self.output_dirs();
        fs::create_dir_all(&dirs.audios)?;
        fs::create_dir_all(&dirs.images)?;
        fs::create_dir_all(&dirs.videos)?;
        Ok(dirs)
    }
}

/// Returns the configured key, falling back to the named environment variable.
pub fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .filter(|k| !k.trim().is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
}
