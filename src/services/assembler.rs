use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::core::config::VideoConfig;
use crate::core::io::Storage;
use crate::core::models::GenerationResult;

/// Turns ordered (image, narration, duration) triples into one video file.
#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(
        &self,
        image_paths: &[String],
        audio_paths: &[String],
        audio_durations: &[f64],
        output_path: &str,
    ) -> GenerationResult;
}

pub struct FfmpegAssembler {
    ffmpeg: String,
    transition: f64,
    fps: u32,
    storage: Arc<dyn Storage>,
}

impl FfmpegAssembler {
    pub fn new(config: &VideoConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            transition: config.image_transition_duration.max(0.0),
            fps: config.fps.max(1),
            storage,
        }
    }

    fn segment_path(output: &Path, index: usize) -> PathBuf {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        output.with_file_name(format!("{}_segment_{:03}.mp4", stem, index + 1))
    }

    /// Arguments rendering one still image over its narration.
    ///
    /// A zero duration means the narration could not be measured; the segment then
    /// ends with the audio stream instead.
    fn segment_args(&self, image: &str, audio: &str, duration: f64, segment: &Path) -> Vec<String> {
        let mut filters = vec!["scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string()];
        if self.transition > 0.0 {
            let fade = if duration > 0.0 {
                self.transition.min(duration)
            } else {
                self.transition
            };
            filters.push(format!("fade=t=in:st=0:d={}", fade));
        }
        filters.push("format=yuv420p".to_string());

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-loop".into(),
            "1".into(),
            "-framerate".into(),
            self.fps.to_string(),
            "-i".into(),
            image.into(),
            "-i".into(),
            audio.into(),
        ];
        if duration > 0.0 {
            args.extend(["-t".to_string(), format!("{:.3}", duration)]);
        } else {
            args.push("-shortest".into());
        }
        args.extend([
            "-vf".to_string(),
            filters.join(","),
            "-r".to_string(),
            self.fps.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-tune".to_string(),
            "stillimage".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            segment.to_string_lossy().to_string(),
        ]);
        args
    }

    fn concat_args(list: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.to_string_lossy().to_string(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.ffmpeg))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ));
        }
        Ok(())
    }

    async fn render(
        &self,
        image_paths: &[String],
        audio_paths: &[String],
        audio_durations: &[f64],
        output: &Path,
        temporaries: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut segments = Vec::with_capacity(image_paths.len());
        for (i, ((image, audio), duration)) in image_paths
            .iter()
            .zip(audio_paths)
            .zip(audio_durations)
            .enumerate()
        {
            info!("Processing scene {}...", i + 1);
            let segment = Self::segment_path(output, i);
            temporaries.push(segment.to_string_lossy().to_string());
            self.run_ffmpeg(&self.segment_args(image, audio, *duration, &segment))
                .await
                .with_context(|| format!("Rendering segment {} failed", i + 1))?;
            segments.push(segment);
        }

        info!("Concatenating {} scenes...", segments.len());
        let list_path = output.with_extension("concat.txt");
        let list_str = list_path.to_string_lossy().to_string();
        temporaries.push(list_str.clone());
        self.storage
            .write(&list_str, concat_list(&segments).as_bytes())
            .await?;

        info!("Writing video file to {}...", output.display());
        self.run_ffmpeg(&Self::concat_args(&list_path, output))
            .await
            .context("Concatenating segments failed")
    }

    async fn cleanup(&self, temporaries: &[String]) {
        for path in temporaries {
            if let Err(e) = self.storage.delete(path).await {
                warn!("Could not remove temporary file {}: {}", path, e);
            }
        }
    }
}

/// Body of an ffmpeg concat demuxer list. Entries are bare file names, resolved
/// relative to the list, which lives next to the segments.
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|s| {
            let name = s
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("file '{}'\n", name.replace('\'', r"'\''"))
        })
        .collect()
}

fn validate_inputs(
    image_paths: &[String],
    audio_paths: &[String],
    audio_durations: &[f64],
) -> Result<(), String> {
    if image_paths.len() != audio_paths.len() || audio_paths.len() != audio_durations.len() {
        return Err(
            "Length mismatch: image_paths, audio_paths, and audio_durations must have the same length."
                .to_string(),
        );
    }
    if image_paths.is_empty() {
        return Err("No images provided for video assembly.".to_string());
    }
    Ok(())
}

#[async_trait]
impl Assembler for FfmpegAssembler {
    async fn assemble(
        &self,
        image_paths: &[String],
        audio_paths: &[String],
        audio_durations: &[f64],
        output_path: &str,
    ) -> GenerationResult {
        info!("Starting video assembly process...");
        if let Err(msg) = validate_inputs(image_paths, audio_paths, audio_durations) {
            error!("{}", msg);
            return GenerationResult::failure(msg);
        }

        let output = Path::new(output_path);
        let mut temporaries = Vec::new();
        let rendered = self
            .render(image_paths, audio_paths, audio_durations, output, &mut temporaries)
            .await;
        self.cleanup(&temporaries).await;

        match rendered {
            Ok(()) => {
                info!("Video assembly complete. Video saved to {}", output_path);
                GenerationResult::success(output_path)
            }
            Err(e) => {
                let msg = format!("Error during video assembly: {:#}", e);
                error!("{}", msg);
                GenerationResult::failure(msg)
            }
        }
    }
}
