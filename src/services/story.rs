use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;

use crate::core::models::StoryWithScenes;
use crate::services::llm::{LlmClient, LlmConfig};

/// Produces the structured story that drives every later stage.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    async fn generate_story(&self, subject: &str, scene_count: usize) -> Result<StoryWithScenes>;
}

const SYSTEM_PROMPT: &str = "You are a highly creative and detail-oriented storytelling AI, \
specializing in crafting short stories perfect for visual adaptation. Reply with valid JSON only.";

const FORMAT_INSTRUCTIONS: &str = r#"Return a single JSON object with exactly these fields:
{
  "title": "a catchy title for the short story",
  "full_story_summary": "a brief summary of the entire story",
  "overall_image_style": "one consistent, descriptive style instruction used as a prefix for every image",
  "main_characters": [
    { "name": "character name", "appearance": "detailed, unchanging visual description: features, clothing, colors" }
  ],
  "scenes": [
    { "scene_number": 1, "visual_description": "concise but highly detailed image prompt for this scene (max 30 words)", "narration_text": "the exact text narrated for this scene" }
  ]
}"#;

pub struct LlmStoryGenerator {
    llm: Box<dyn LlmClient>,
    retry_count: usize,
    retry_delay: Duration,
}

impl LlmStoryGenerator {
    pub fn new(llm: Box<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            retry_count: config.retry_count,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
        }
    }

    pub fn build_prompt(subject: &str, scene_count: usize, word_limit: usize) -> String {
        format!(
            "Your task is to generate a complete story and segment it into {scene_count} distinct scenes.\n\n\
            Crucial instructions for visual consistency and detail:\n\
            1. Overall image style: define a single, consistent and highly descriptive visual style that applies to all images of this story.\n\
            2. Character consistency: for each main character, provide a detailed and unchanging description of their appearance. \
            Refer to characters by their exact name in every visual_description where they appear.\n\
            3. Scene breakdown: each scene has a concise but extremely detailed visual_description and the exact narration_text for that segment. \
            The narration_text of all scenes, read in order, must form the complete story described by full_story_summary.\n\n\
            Story requirements:\n\
            * Around {word_limit} words in total.\n\
            * Exactly {scene_count} scenes, numbered 1 to {scene_count} in order.\n\
            * Logical flow and progression between scenes.\n\n\
            Subject for the story: {subject}\n\n\
            Output format instructions:\n{FORMAT_INSTRUCTIONS}"
        )
    }

    async fn request_story(&self, prompt: &str, scene_count: usize) -> Result<StoryWithScenes> {
        let response = self.llm.chat(SYSTEM_PROMPT, prompt).await?;
        let story = parse_story(&response).map_err(|e| {
            debug!("Raw LLM output (for debugging parsing issues):\n{}", response);
            e
        })?;
        story.validate(scene_count)?;
        Ok(story)
    }
}

#[async_trait]
impl StoryGenerator for LlmStoryGenerator {
    async fn generate_story(&self, subject: &str, scene_count: usize) -> Result<StoryWithScenes> {
        if scene_count == 0 {
            return Err(anyhow!("scene count must be at least 1"));
        }

        let prompt = Self::build_prompt(subject, scene_count, scene_count * 50);
        info!(
            "Generating structured story for subject: '{}' with {} scenes...",
            subject, scene_count
        );

        let mut attempt = 0;
        loop {
            match self.request_story(&prompt, scene_count).await {
                Ok(story) => {
                    info!("Structured story generated: '{}'", story.title);
                    return Ok(story);
                }
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(
                        "Story generation failed ({}), retrying {}/{} in {:?}",
                        e, attempt, self.retry_count, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Could not generate structured story for '{}'", subject)
                    })
                }
            }
        }
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

pub fn parse_story(response: &str) -> Result<StoryWithScenes> {
    let clean_json = strip_code_blocks(response);
    serde_json::from_str(&clean_json)
        .with_context(|| format!("Failed to parse story JSON: {}", clean_json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const STORY_JSON: &str = r#"```json
{
  "title": "The Acorn Heist",
  "full_story_summary": "A squirrel outwits a wizard.",
  "overall_image_style": "Watercolor painting",
  "main_characters": [{"name": "Nutty", "appearance": "red squirrel, blue scarf"}],
  "scenes": [
    {"scene_number": 1, "visual_description": "Nutty eyes the acorn", "narration_text": "Nutty saw it."},
    {"scene_number": 2, "visual_description": "Nutty runs", "narration_text": "Nutty ran."}
  ]
}
```"#;

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(anyhow!("no scripted response left"));
            }
            responses.remove(0)
        }
    }

    fn config(retry_count: usize) -> LlmConfig {
        LlmConfig {
            retry_count,
            retry_delay_seconds: 0,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_prompt_mentions_counts_and_subject() {
        let prompt = LlmStoryGenerator::build_prompt("a brave toaster", 3, 150);
        assert!(prompt.contains("into 3 distinct scenes"));
        assert!(prompt.contains("Around 150 words"));
        assert!(prompt.contains("Subject for the story: a brave toaster"));
        assert!(prompt.contains("\"overall_image_style\""));
    }

    #[tokio::test]
    async fn test_generate_story_parses_fenced_json() -> Result<()> {
        let llm = ScriptedLlm::new(vec![Ok(STORY_JSON.to_string())]);
        let generator = LlmStoryGenerator::new(Box::new(llm), &config(0));

        let story = generator.generate_story("squirrels", 2).await?;
        assert_eq!(story.title, "The Acorn Heist");
        assert_eq!(story.scenes.len(), 2);
        assert_eq!(story.scenes[1].scene_number, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_story_retries_malformed_output() -> Result<()> {
        let llm = ScriptedLlm::new(vec![
            Ok("I am not JSON".to_string()),
            Err(anyhow!("503 Service Unavailable")),
            Ok(STORY_JSON.to_string()),
        ]);
        let calls = llm.calls.clone();
        let generator = LlmStoryGenerator::new(Box::new(llm), &config(2));

        let story = generator.generate_story("squirrels", 2).await?;
        assert_eq!(story.scenes.len(), 2);
        assert_eq!(*calls.lock().unwrap(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_generate_story_rejects_wrong_scene_count() {
        let llm = ScriptedLlm::new(vec![Ok(STORY_JSON.to_string())]);
        let calls = llm.calls.clone();
        let generator = LlmStoryGenerator::new(Box::new(llm), &config(0));

        let err = generator.generate_story("squirrels", 3).await.unwrap_err();
        assert!(format!("{:#}", err).contains("expected 3 scenes"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_scenes_is_rejected_without_calling_llm() {
        let llm = ScriptedLlm::new(vec![]);
        let calls = llm.calls.clone();
        let generator = LlmStoryGenerator::new(Box::new(llm), &config(3));

        assert!(generator.generate_story("anything", 0).await.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
