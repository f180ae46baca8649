use crate::core::config::{Config, OutputDirs};
use crate::core::io::Storage;
use crate::core::models::{GenerationResult, Scene, SceneAsset, StoryWithScenes};
use crate::services::assembler::{Assembler, FfmpegAssembler};
use crate::services::llm::create_llm;
use crate::services::narration::{create_narration_provider, NarrationProvider};
use crate::services::story::{LlmStoryGenerator, StoryGenerator};
use crate::services::visual::{create_visual_provider, VisualGenerator};
use anyhow::Result;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Pipeline stages in the only order they can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Story,
    Narration,
    Visuals,
    Video,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Story, Stage::Narration, Stage::Visuals, Stage::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Story => "story",
            Stage::Narration => "narration",
            Stage::Visuals => "visuals",
            Stage::Video => "video",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `create_video` run, including the raw result of every stage that ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub error: String,
    pub steps_completed: Vec<Stage>,
    pub story: Option<StoryWithScenes>,
    pub narration_results: Vec<GenerationResult>,
    pub visual_results: Vec<GenerationResult>,
    pub video_result: Option<GenerationResult>,
}

impl PipelineResult {
    fn complete(&mut self, stage: Stage) {
        self.steps_completed.push(stage);
    }

    fn abort(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = message.into();
        error!(
            "Pipeline stopped: {} (steps completed: [{}])",
            self.error,
            self.steps_summary()
        );
        self
    }

    pub fn steps_summary(&self) -> String {
        self.steps_completed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn video_path(&self) -> Option<&str> {
        self.video_result
            .as_ref()
            .filter(|r| r.success)
            .map(|r| r.output_path.as_str())
    }
}

pub struct WorkflowManager {
    story_generator: Box<dyn StoryGenerator>,
    narration: Box<dyn NarrationProvider>,
    visuals: VisualGenerator,
    assembler: Box<dyn Assembler>,
    dirs: OutputDirs,
    video_filename: String,
    max_concurrency: usize,
}

impl WorkflowManager {
    pub fn new(
        config: &Config,
        story_generator: Box<dyn StoryGenerator>,
        narration: Box<dyn NarrationProvider>,
        visuals: VisualGenerator,
        assembler: Box<dyn Assembler>,
    ) -> Self {
        Self {
            story_generator,
            narration,
            visuals,
            assembler,
            dirs: config.output_dirs(),
            video_filename: config.output.video_filename.clone(),
            max_concurrency: config.pipeline.max_concurrency.max(1),
        }
    }

    /// Builds every collaborator from configuration. Fails when a selected provider
    /// is missing its credentials.
    pub fn from_config(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let llm = create_llm(&config.llm)?;
        let story_generator = Box::new(LlmStoryGenerator::new(llm, &config.llm));
        let narration = create_narration_provider(config, storage.clone())?;
        let visuals = VisualGenerator::new(create_visual_provider(config, storage.clone())?);
        let assembler = Box::new(FfmpegAssembler::new(&config.video, storage));
        info!(
            "Providers: narration={}, visual={}",
            narration.name(),
            visuals.provider_name()
        );
        Ok(Self::new(config, story_generator, narration, visuals, assembler))
    }

    pub async fn create_video(&self, subject: &str, num_scenes: usize) -> PipelineResult {
        let mut result = PipelineResult::default();

        info!("Generating story with {} scenes for: {}", num_scenes, subject);
        let story = match self.story_generator.generate_story(subject, num_scenes).await {
            Ok(story) => story,
            Err(e) => return result.abort(format!("Story generation failed: {:#}", e)),
        };
        if let Err(e) = story.validate(num_scenes) {
            return result.abort(format!("Story generation returned a malformed story: {:#}", e));
        }
        info!("Story generated: '{}'", story.title);
        result.complete(Stage::Story);

        let outcome = self.render_story(&story, &mut result).await;
        result.story = Some(story);
        match outcome {
            Ok(path) => {
                result.success = true;
                info!("Video created: {}", path);
                result
            }
            Err(message) => result.abort(message),
        }
    }

    /// Narration, visuals, reconciliation and assembly for an accepted story. Each
    /// completed stage is recorded on `result`; the error is the hard-stop reason.
    async fn render_story(
        &self,
        story: &StoryWithScenes,
        result: &mut PipelineResult,
    ) -> Result<String, String> {
        let total = story.scenes.len();

        result.narration_results = self.narrate_scenes(&story.scenes).await;
        let narrated = result.narration_results.iter().filter(|r| r.success).count();
        if narrated == 0 {
            return Err("Failed to generate narration for every scene".to_string());
        }
        info!("Narration ready for {}/{} scenes", narrated, total);
        result.complete(Stage::Narration);

        result.visual_results = self.illustrate_scenes(story).await;
        let illustrated = result.visual_results.iter().filter(|r| r.success).count();
        if illustrated == 0 {
            return Err("Failed to generate images for every scene".to_string());
        }
        info!("Images ready for {}/{} scenes", illustrated, total);
        result.complete(Stage::Visuals);

        let assets = reconcile_scenes(
            &story.scenes,
            &result.narration_results,
            &result.visual_results,
        );
        if assets.is_empty() {
            return Err(
                "No scene has both narration and an image; nothing left to assemble".to_string(),
            );
        }
        info!("Assembling {} of {} scenes", assets.len(), total);

        let image_paths: Vec<String> = assets.iter().map(|a| a.image_path.clone()).collect();
        let audio_paths: Vec<String> = assets.iter().map(|a| a.audio_path.clone()).collect();
        let durations: Vec<f64> = assets.iter().map(|a| a.duration).collect();
        let output_path = self
            .dirs
            .videos
            .join(&self.video_filename)
            .to_string_lossy()
            .to_string();

        let video = self
            .assembler
            .assemble(&image_paths, &audio_paths, &durations, &output_path)
            .await;
        let failure = (!video.success).then(|| format!("Video assembly failed: {}", video.error));
        result.video_result = Some(video);
        if let Some(message) = failure {
            return Err(message);
        }
        result.complete(Stage::Video);
        Ok(output_path)
    }

    async fn narrate_scenes(&self, scenes: &[Scene]) -> Vec<GenerationResult> {
        let narration = &self.narration;
        let jobs = scenes.iter().map(|scene| {
            let path = self
                .dirs
                .audios
                .join(format!("scene_{}_narration.mp3", scene.scene_number))
                .to_string_lossy()
                .to_string();
            async move {
                let result = narration.synthesize(&scene.narration_text, &path).await;
                if !result.success {
                    warn!(
                        "Narration for scene {} failed: {}",
                        scene.scene_number, result.error
                    );
                }
                result
            }
        });
        self.fan_out(Stage::Narration, jobs.collect()).await
    }

    async fn illustrate_scenes(&self, story: &StoryWithScenes) -> Vec<GenerationResult> {
        let visuals = &self.visuals;
        let jobs = story.scenes.iter().map(|scene| {
            let path = self
                .dirs
                .images
                .join(format!("scene_{}_image.png", scene.scene_number))
                .to_string_lossy()
                .to_string();
            async move {
                let result = visuals
                    .generate_image(
                        &story.overall_image_style,
                        &story.main_characters,
                        &scene.visual_description,
                        &path,
                    )
                    .await;
                if !result.success {
                    warn!("Image for scene {} failed: {}", scene.scene_number, result.error);
                }
                result
            }
        });
        self.fan_out(Stage::Visuals, jobs.collect()).await
    }

    /// Runs one job per scene with at most `max_concurrency` in flight and returns
    /// the results in job order, whatever order they finished in.
    async fn fan_out<F>(&self, stage: Stage, jobs: Vec<F>) -> Vec<GenerationResult>
    where
        F: Future<Output = GenerationResult>,
    {
        let pb = ProgressBar::new(jobs.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(stage.as_str());

        let mut results: Vec<(usize, GenerationResult)> =
            futures_util::stream::iter(jobs.into_iter().enumerate())
                .map(|(i, job)| {
                    let pb = pb.clone();
                    async move {
                        let result = job.await;
                        pb.inc(1);
                        (i, result)
                    }
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        pb.finish_with_message(format!("{} complete", stage));
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }
}

/// Pairs narration and visual results by index and keeps only the scenes where both
/// succeeded, sorted by `scene_number`.
pub fn reconcile_scenes(
    scenes: &[Scene],
    narrations: &[GenerationResult],
    visuals: &[GenerationResult],
) -> Vec<SceneAsset> {
    let mut assets: Vec<SceneAsset> = scenes
        .iter()
        .zip(narrations)
        .zip(visuals)
        .filter_map(|((scene, narration), visual)| {
            if narration.success && visual.success {
                Some(SceneAsset {
                    scene_number: scene.scene_number,
                    image_path: visual.output_path.clone(),
                    audio_path: narration.output_path.clone(),
                    duration: narration.duration,
                })
            } else {
                warn!(
                    "Dropping scene {} (narration ok: {}, image ok: {})",
                    scene.scene_number, narration.success, visual.success
                );
                None
            }
        })
        .collect();
    assets.sort_by_key(|a| a.scene_number);
    assets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::sample_story;
    use crate::services::visual::VisualProvider;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    enum StoryBehaviour {
        Valid,
        Fail,
        WrongCount,
    }

    struct MockStoryGenerator {
        behaviour: StoryBehaviour,
    }

    #[async_trait]
    impl StoryGenerator for MockStoryGenerator {
        async fn generate_story(&self, _subject: &str, scene_count: usize) -> Result<StoryWithScenes> {
            match self.behaviour {
                StoryBehaviour::Valid => Ok(sample_story(scene_count)),
                StoryBehaviour::Fail => Err(anyhow!("LLM returned garbage")),
                StoryBehaviour::WrongCount => Ok(sample_story(scene_count + 1)),
            }
        }
    }

    fn scene_of(path: &str, failing: &[usize]) -> bool {
        failing
            .iter()
            .any(|n| path.contains(&format!("scene_{}_", n)))
    }

    struct MockNarration {
        failing: Vec<usize>,
        stagger: bool,
    }

    #[async_trait]
    impl NarrationProvider for MockNarration {
        fn name(&self) -> &'static str {
            "mock"
        }
        async fn synthesize(&self, text: &str, output_path: &str) -> GenerationResult {
            if self.stagger {
                // later scenes finish first
                let n: u64 = text
                    .trim_start_matches("Narration for scene ")
                    .trim_end_matches('.')
                    .parse()
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(60u64.saturating_sub(n * 10))).await;
            }
            if scene_of(output_path, &self.failing) {
                GenerationResult::failure("mock narration error")
            } else {
                GenerationResult::success(output_path).with_duration(2.0)
            }
        }
    }

    struct MockVisual {
        failing: Vec<usize>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl VisualProvider for MockVisual {
        fn name(&self) -> &'static str {
            "mock"
        }
        async fn render(&self, prompt: &str, output_path: &str) -> GenerationResult {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if scene_of(output_path, &self.failing) {
                GenerationResult::failure("mock visual error")
            } else {
                GenerationResult::success(output_path)
            }
        }
    }

    type AssembleCall = (Vec<String>, Vec<String>, Vec<f64>, String);

    struct MockAssembler {
        fail: bool,
        calls: Arc<Mutex<Vec<AssembleCall>>>,
    }

    #[async_trait]
    impl Assembler for MockAssembler {
        async fn assemble(
            &self,
            image_paths: &[String],
            audio_paths: &[String],
            audio_durations: &[f64],
            output_path: &str,
        ) -> GenerationResult {
            self.calls.lock().unwrap().push((
                image_paths.to_vec(),
                audio_paths.to_vec(),
                audio_durations.to_vec(),
                output_path.to_string(),
            ));
            if self.fail {
                GenerationResult::failure("encoder crashed")
            } else {
                GenerationResult::success(output_path)
            }
        }
    }

    struct Harness {
        manager: WorkflowManager,
        calls: Arc<Mutex<Vec<AssembleCall>>>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    struct Setup {
        story: StoryBehaviour,
        narration_failing: Vec<usize>,
        visual_failing: Vec<usize>,
        assembler_fails: bool,
        max_concurrency: usize,
        stagger: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                story: StoryBehaviour::Valid,
                narration_failing: Vec::new(),
                visual_failing: Vec::new(),
                assembler_fails: false,
                max_concurrency: 1,
                stagger: false,
            }
        }
    }

    fn harness(setup: Setup) -> Harness {
        let mut config = Config::default();
        config.output.base_folder = "/tmp/shortfactory-test".to_string();
        config.pipeline.max_concurrency = setup.max_concurrency;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let manager = WorkflowManager::new(
            &config,
            Box::new(MockStoryGenerator {
                behaviour: setup.story,
            }),
            Box::new(MockNarration {
                failing: setup.narration_failing,
                stagger: setup.stagger,
            }),
            VisualGenerator::new(Box::new(MockVisual {
                failing: setup.visual_failing,
                prompts: prompts.clone(),
            })),
            Box::new(MockAssembler {
                fail: setup.assembler_fails,
                calls: calls.clone(),
            }),
        );
        Harness {
            manager,
            calls,
            prompts,
        }
    }

    fn assert_prefix(steps: &[Stage]) {
        assert_eq!(steps, &Stage::ORDER[..steps.len()]);
    }

    #[tokio::test]
    async fn test_all_scenes_succeed() {
        let h = harness(Setup::default());
        let result = h.manager.create_video("a squirrel", 3).await;

        assert!(result.success, "{}", result.error);
        assert!(result.error.is_empty());
        assert_eq!(result.steps_completed, Stage::ORDER.to_vec());

        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (images, audios, durations, output) = &calls[0];
        assert_eq!(
            images,
            &vec![
                "/tmp/shortfactory-test/story_images/scene_1_image.png".to_string(),
                "/tmp/shortfactory-test/story_images/scene_2_image.png".to_string(),
                "/tmp/shortfactory-test/story_images/scene_3_image.png".to_string(),
            ]
        );
        assert_eq!(
            audios[2],
            "/tmp/shortfactory-test/story_audios/scene_3_narration.mp3"
        );
        assert_eq!(durations, &vec![2.0, 2.0, 2.0]);
        assert_eq!(output, "/tmp/shortfactory-test/final_videos/final_video.mp4");
        assert_eq!(
            result.video_path(),
            Some("/tmp/shortfactory-test/final_videos/final_video.mp4")
        );
    }

    #[tokio::test]
    async fn test_image_prompts_carry_style_and_characters() {
        let h = harness(Setup::default());
        h.manager.create_video("a squirrel", 1).await;

        let prompts = h.prompts.lock().unwrap();
        assert_eq!(
            prompts[0],
            "Watercolor painting, soft lighting, \
             Nutty (a small red squirrel with a blue scarf) sneaks past \
             Grimble (an old wizard with a grey beard), moment 1"
        );
    }

    #[tokio::test]
    async fn test_story_failure_is_a_hard_stop() {
        let h = harness(Setup {
            story: StoryBehaviour::Fail,
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 3).await;

        assert!(!result.success);
        assert!(result.steps_completed.is_empty());
        assert!(result.error.contains("LLM returned garbage"));
        assert!(result.story.is_none());
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_story_is_a_hard_stop() {
        let h = harness(Setup {
            story: StoryBehaviour::WrongCount,
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 2).await;

        assert!(!result.success);
        assert!(result.steps_completed.is_empty());
        assert!(result.narration_results.is_empty());
    }

    #[tokio::test]
    async fn test_all_narrations_failing_stops_after_story() {
        let h = harness(Setup {
            narration_failing: vec![1, 2],
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 2).await;

        assert!(!result.success);
        assert_eq!(result.steps_completed, vec![Stage::Story]);
        assert_eq!(result.narration_results.len(), 2);
        assert!(result.visual_results.is_empty());
        assert!(h.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_visuals_failing_stops_after_narration() {
        let h = harness(Setup {
            visual_failing: vec![1, 2],
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 2).await;

        assert!(!result.success);
        assert_eq!(result.steps_completed, vec![Stage::Story, Stage::Narration]);
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disjoint_failures_leave_nothing_to_assemble() {
        let h = harness(Setup {
            narration_failing: vec![1],
            visual_failing: vec![2],
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 2).await;

        assert!(!result.success);
        assert_eq!(
            result.steps_completed,
            vec![Stage::Story, Stage::Narration, Stage::Visuals]
        );
        assert!(result.video_result.is_none());
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failures_drop_scenes_without_gaps() {
        let h = harness(Setup {
            narration_failing: vec![2],
            visual_failing: vec![4],
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 5).await;

        assert!(result.success);
        let calls = h.calls.lock().unwrap();
        let (images, audios, durations, _) = &calls[0];
        assert_eq!(images.len(), 3);
        assert!(images[0].ends_with("scene_1_image.png"));
        assert!(images[1].ends_with("scene_3_image.png"));
        assert!(images[2].ends_with("scene_5_image.png"));
        assert!(audios[1].ends_with("scene_3_narration.mp3"));
        assert_eq!(durations.len(), 3);
    }

    #[tokio::test]
    async fn test_assembler_failure_keeps_three_steps() {
        let h = harness(Setup {
            assembler_fails: true,
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 2).await;

        assert!(!result.success);
        assert_eq!(
            result.steps_completed,
            vec![Stage::Story, Stage::Narration, Stage::Visuals]
        );
        assert!(result.error.contains("encoder crashed"));
        assert!(result.video_path().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_fan_out_keeps_scene_order() {
        let h = harness(Setup {
            max_concurrency: 4,
            stagger: true,
            ..Default::default()
        });
        let result = h.manager.create_video("a squirrel", 4).await;

        assert!(result.success);
        for (i, r) in result.narration_results.iter().enumerate() {
            assert!(r.output_path.ends_with(&format!("scene_{}_narration.mp3", i + 1)));
        }
        let calls = h.calls.lock().unwrap();
        let (images, _, _, _) = &calls[0];
        for (i, image) in images.iter().enumerate() {
            assert!(image.ends_with(&format!("scene_{}_image.png", i + 1)));
        }
    }

    #[tokio::test]
    async fn test_steps_are_always_a_prefix() {
        let setups = vec![
            Setup::default(),
            Setup {
                story: StoryBehaviour::Fail,
                ..Default::default()
            },
            Setup {
                narration_failing: vec![1, 2, 3],
                ..Default::default()
            },
            Setup {
                visual_failing: vec![1, 2, 3],
                ..Default::default()
            },
            Setup {
                narration_failing: vec![1],
                visual_failing: vec![2, 3],
                ..Default::default()
            },
            Setup {
                assembler_fails: true,
                ..Default::default()
            },
        ];
        for setup in setups {
            let result = harness(setup).manager.create_video("s", 3).await;
            assert_prefix(&result.steps_completed);
            assert_eq!(result.success, result.steps_completed.len() == 4);
        }
    }

    fn ok(path: &str, duration: f64) -> GenerationResult {
        GenerationResult::success(path).with_duration(duration)
    }

    #[test]
    fn test_reconcile_is_pure_and_sorted() {
        let mut scenes = sample_story(3).scenes;
        scenes.reverse();
        let narrations = vec![ok("a3", 3.0), GenerationResult::failure("x"), ok("a1", 1.0)];
        let visuals = vec![ok("i3", 0.0), ok("i2", 0.0), ok("i1", 0.0)];

        let first = reconcile_scenes(&scenes, &narrations, &visuals);
        let second = reconcile_scenes(&scenes, &narrations, &visuals);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                SceneAsset {
                    scene_number: 1,
                    image_path: "i1".to_string(),
                    audio_path: "a1".to_string(),
                    duration: 1.0,
                },
                SceneAsset {
                    scene_number: 3,
                    image_path: "i3".to_string(),
                    audio_path: "a3".to_string(),
                    duration: 3.0,
                },
            ]
        );
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&Stage::ORDER).unwrap();
        assert_eq!(json, r#"["story","narration","visuals","video"]"#);
    }
}
