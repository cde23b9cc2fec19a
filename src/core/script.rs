use crate::core::error::PipelineError;
use crate::services::characters::CharacterRegistry;
use serde::{Deserialize, Serialize};

pub const MIN_SCENES: usize = 5;
pub const MAX_SCENES: usize = 8;

/// Root artifact of stage 1 and the hand-off contract for stages 2-4.
///
/// Written once to `build/<run_id>/script.json`, read-only afterwards;
/// downstream stages never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDocument {
    pub metadata: Metadata,
    pub scenes: Vec<Scene>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub lesson: String,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default)]
    pub cast: Vec<CastEntry>,
}

/// Cast listing as stated by the narrative service. Informational only;
/// the authoritative identities come from the character registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastEntry {
    pub name: String,
    #[serde(default)]
    pub voice_type: String,
    #[serde(default)]
    pub approximate_age: String,
    #[serde(default)]
    pub traits: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub number: u32,
    #[serde(default)]
    pub ambient_sound: String,
    pub image_description: String,
    pub dialogue: Dialogue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialogue {
    pub character: String,
    pub text: String,
    #[serde(default)]
    pub emotion: String,
}

impl ScriptDocument {
    /// Checks the structural invariants every downstream stage relies on.
    ///
    /// Runs before any asset generation; a failure here rejects the whole
    /// document since a broken script cannot be partially repaired.
    pub fn validate(&self, registry: &CharacterRegistry) -> Result<(), PipelineError> {
        let n = self.scenes.len();
        if !(MIN_SCENES..=MAX_SCENES).contains(&n) {
            return Err(PipelineError::ContractViolation(format!(
                "expected {MIN_SCENES}-{MAX_SCENES} scenes, got {n}"
            )));
        }

        for (i, scene) in self.scenes.iter().enumerate() {
            let expected = (i + 1) as u32;
            if scene.number != expected {
                return Err(PipelineError::ContractViolation(format!(
                    "scene numbering broken: position {} holds scene number {}",
                    expected, scene.number
                )));
            }
            if scene.image_description.trim().is_empty() {
                return Err(PipelineError::ContractViolation(format!(
                    "scene {} has an empty image description",
                    scene.number
                )));
            }
            if scene.dialogue.text.trim().is_empty() {
                return Err(PipelineError::ContractViolation(format!(
                    "scene {} has an empty dialogue",
                    scene.number
                )));
            }
            registry.lookup(&scene.dialogue.character)?;
        }

        Ok(())
    }
}

/// Strips markdown code fences some models wrap around JSON output.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::characters::CharacterRegistry;
    use std::path::Path;

    fn scene(number: u32, character: &str) -> Scene {
        Scene {
            number,
            ambient_sound: "pájaros cantando".to_string(),
            image_description: "Lucas y Sofia juegan en la plaza".to_string(),
            dialogue: Dialogue {
                character: character.to_string(),
                text: "¡Hola!".to_string(),
                emotion: "feliz".to_string(),
            },
        }
    }

    fn document(scenes: Vec<Scene>) -> ScriptDocument {
        ScriptDocument {
            metadata: Metadata {
                title: "La plaza".to_string(),
                lesson: "compartir con los demás".to_string(),
                estimated_duration: "6 min".to_string(),
                cast: vec![],
            },
            scenes,
        }
    }

    fn registry() -> CharacterRegistry {
        CharacterRegistry::builtin(Path::new("assets"))
    }

    #[test]
    fn accepts_contiguous_numbering() {
        let doc = document((1..=5).map(|n| scene(n, "Lucas")).collect());
        assert!(doc.validate(&registry()).is_ok());
    }

    #[test]
    fn rejects_too_few_scenes() {
        let doc = document((1..=4).map(|n| scene(n, "Lucas")).collect());
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    #[test]
    fn rejects_too_many_scenes() {
        let doc = document((1..=9).map(|n| scene(n, "Lucas")).collect());
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    #[test]
    fn rejects_gap_in_numbering() {
        let mut scenes: Vec<Scene> = (1..=5).map(|n| scene(n, "Lucas")).collect();
        scenes[3].number = 7;
        let doc = document(scenes);
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    #[test]
    fn rejects_duplicate_numbering() {
        let mut scenes: Vec<Scene> = (1..=5).map(|n| scene(n, "Sofia")).collect();
        scenes[2].number = 2;
        let doc = document(scenes);
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    #[test]
    fn rejects_unknown_speaker() {
        let mut scenes: Vec<Scene> = (1..=5).map(|n| scene(n, "Lucas")).collect();
        scenes[1].dialogue.character = "Gandalf".to_string();
        let doc = document(scenes);
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::UnknownCharacter(_))
        ));
    }

    #[test]
    fn rejects_empty_dialogue() {
        let mut scenes: Vec<Scene> = (1..=5).map(|n| scene(n, "Lucas")).collect();
        scenes[0].dialogue.text = "  ".to_string();
        let doc = document(scenes);
        assert!(matches!(
            doc.validate(&registry()),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("{}"), "{}");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }
}
