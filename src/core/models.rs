use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A main character with an appearance string that is reused verbatim in every
/// image prompt mentioning the character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterDescription {
    pub name: String,
    pub appearance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_number: usize,
    pub visual_description: String,
    pub narration_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryWithScenes {
    pub title: String,
    pub full_story_summary: String,
    pub overall_image_style: String,
    pub main_characters: Vec<CharacterDescription>,
    pub scenes: Vec<Scene>,
}

impl StoryWithScenes {
    /// Checks the structural contract every later stage depends on: exactly
    /// `expected_scenes` scenes numbered 1..=n in order, and unique character names.
    pub fn validate(&self, expected_scenes: usize) -> Result<()> {
        if self.scenes.len() != expected_scenes {
            return Err(anyhow!(
                "expected {} scenes, story has {}",
                expected_scenes,
                self.scenes.len()
            ));
        }

        for (i, scene) in self.scenes.iter().enumerate() {
            if scene.scene_number != i + 1 {
                return Err(anyhow!(
                    "scene at position {} is numbered {}, expected {}",
                    i,
                    scene.scene_number,
                    i + 1
                ));
            }
        }

        let mut seen = HashSet::new();
        for character in &self.main_characters {
            if !seen.insert(character.name.to_lowercase()) {
                return Err(anyhow!("duplicate character name: {}", character.name));
            }
        }

        Ok(())
    }
}

/// Uniform return value of every stage-level generation call.
///
/// `success` implies a non-empty `output_path` and an empty `error`; a failure always
/// carries an empty `output_path`. `duration` is only set by narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationResult {
    pub success: bool,
    pub output_path: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub duration: f64,
}

impl GenerationResult {
    pub fn success(output_path: impl Into<String>) -> Self {
        Self {
            success: true,
            output_path: output_path.into(),
            error: String::new(),
            duration: 0.0,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output_path: String::new(),
            error: error.into(),
            duration: 0.0,
        }
    }
}

/// One reconciled scene: an image shown for `duration` seconds while `audio_path` plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAsset {
    pub scene_number: usize,
    pub image_path: String,
    pub audio_path: String,
    pub duration: f64,
}

#[cfg(test)]
pub(crate) fn sample_story(num_scenes: usize) -> StoryWithScenes {
    StoryWithScenes {
        title: "The Acorn Heist".to_string(),
        full_story_summary: "A squirrel outwits a wizard.".to_string(),
        overall_image_style: "Watercolor painting, soft lighting".to_string(),
        main_characters: vec![
            CharacterDescription {
                name: "Nutty".to_string(),
                appearance: "a small red squirrel with a blue scarf".to_string(),
            },
            CharacterDescription {
                name: "Grimble".to_string(),
                appearance: "an old wizard with a grey beard".to_string(),
            },
        ],
        scenes: (1..=num_scenes)
            .map(|n| Scene {
                scene_number: n,
                visual_description: format!("Nutty sneaks past Grimble, moment {}", n),
                narration_text: format!("Narration for scene {}.", n),
            })
            .collect(),
    }
}
