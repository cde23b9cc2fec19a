use anyhow::{Context, Result};
use log::warn;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::UserProfile;
use crate::core::script::{strip_code_blocks, ScriptDocument, MAX_SCENES, MIN_SCENES};
use crate::services::characters::CharacterRegistry;
use crate::services::llm::{LlmClient, LlmConfig};

const SYSTEM_PROMPT: &str = "Eres un guionista de cuentos educativos infantiles. \
Respondes únicamente con JSON válido, sin texto adicional.";

/// Stage 1: turns a moral into a validated script document.
pub struct NarrativeGenerator {
    llm: Box<dyn LlmClient>,
    registry: Arc<CharacterRegistry>,
    profile: Option<UserProfile>,
    retry_count: u32,
    retry_delay: Duration,
}

impl NarrativeGenerator {
    pub fn new(
        llm: Box<dyn LlmClient>,
        registry: Arc<CharacterRegistry>,
        profile: Option<UserProfile>,
        llm_config: &LlmConfig,
    ) -> Self {
        Self {
            llm,
            registry,
            profile,
            retry_count: llm_config.retry_count.max(1),
            retry_delay: Duration::from_secs(llm_config.retry_delay_seconds),
        }
    }

    /// Generates and validates a script. Retries the whole
    /// generate-parse-validate sequence; a script that fails validation is
    /// discarded, never repaired.
    pub async fn generate(&self, moral: &str) -> Result<ScriptDocument> {
        let prompt = self.build_prompt(moral);
        let mut last_err = None;

        for attempt in 1..=self.retry_count {
            match self.attempt(&prompt).await {
                Ok(doc) => return Ok(doc),
                Err(e) => {
                    warn!("script generation attempt {attempt} failed: {e:#}");
                    last_err = Some(e);
                    if attempt < self.retry_count {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err.expect("retry_count is at least 1"))
    }

    async fn attempt(&self, prompt: &str) -> Result<ScriptDocument> {
        let raw = self.llm.chat(SYSTEM_PROMPT, prompt).await?;
        let cleaned = strip_code_blocks(&raw);
        let doc: ScriptDocument = serde_json::from_str(&cleaned)
            .with_context(|| format!("script is not valid JSON: {}", truncate(&cleaned, 200)))?;
        doc.validate(&self.registry)?;
        Ok(doc)
    }

    fn build_prompt(&self, moral: &str) -> String {
        let roster = self
            .registry
            .all()
            .iter()
            .map(|c| format!("{} ({}, {})", c.display_name, c.personality, c.age_descriptor))
            .collect::<Vec<_>>()
            .join(", ");

        let mut prompt = format!(
            "Genera UN SOLO JSON que cumpla con este esquema:\n\
Esquema: {{\n\
  \"metadata\":{{\n\
    \"title\":\"string\",\n\
    \"lesson\":\"string\",\n\
    \"estimated_duration\":\"string\",\n\
    \"cast\":[{{\n\
      \"name\":\"string\",\n\
      \"voice_type\":\"string\",\n\
      \"approximate_age\":\"string\",\n\
      \"traits\":\"string\"\n\
    }}]\n\
  }},\n\
  \"scenes\":[{{\n\
    \"number\":number,\n\
    \"ambient_sound\":\"string\",\n\
    \"image_description\":\"string\",\n\
    \"dialogue\":{{\n\
      \"character\":\"string\",\n\
      \"text\":\"string\",\n\
      \"emotion\":\"string\"\n\
    }}\n\
  }}]\n\
}}\n\
Reglas:\n\
- Usar SOLO estos personajes: {roster}.\n\
- NO crear personajes adicionales a los mencionados previamente.\n\
- Generar entre {MIN_SCENES}-{MAX_SCENES} escenas (pocas escenas, historia concisa).\n\
- Numerar las escenas consecutivamente desde 1.\n\
- Estructura sugerida: inicio (presentación), desarrollo (aprendizaje), cierre (moraleja).\n\
- Cada escena tiene 1 diálogo y descripción visual.\n\
- Título relacionado con la moraleja.\n\
- Diálogos simples para niños 5-8 años, en español.\n\
- Para las escenas puedes elegir solamente entre estos escenarios: parque, habitación, bosque, hospital, colegio, calle.\n\
- Emociones variadas: curioso, feliz, sorprendido, etc.\n\
Moraleja: \"{moral}\"\n\
Devuelve únicamente el JSON, sin texto adicional."
        );

        if let Some(profile) = &self.profile {
            prompt.push_str(&self.profile_block(profile));
        }

        prompt
    }

    fn profile_block(&self, profile: &UserProfile) -> String {
        let mut adaptations = vec![
            format!("- Edad del espectador: {} años.", profile.age),
            format!("- Nivel de complejidad: {}.", profile.level),
        ];
        if let Some(style) = &profile.style {
            adaptations.push(format!("- Estilo narrativo preferido: {style}."));
        }
        if !profile.topics.is_empty() {
            adaptations.push(format!(
                "- Temas favoritos: {}.",
                profile.topics.join(", ")
            ));
        }

        format!(
            "\n\nPERSONALIZACIONES OPCIONALES (solo aplicar si es compatible con la moraleja principal):\n\
{}\n\
IMPORTANTE: La moraleja especificada arriba es PRIORITARIA sobre las personalizaciones.\n\
Si hay conflicto entre la moraleja y estas sugerencias de estilo, la moraleja SIEMPRE gana.",
            adaptations.join("\n")
        )
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn valid_script_json() -> String {
        let scenes: Vec<String> = (1..=5)
            .map(|n| {
                format!(
                    r#"{{"number":{n},"ambient_sound":"pájaros","image_description":"Lucas en el parque","dialogue":{{"character":"Lucas","text":"Hola","emotion":"feliz"}}}}"#
                )
            })
            .collect();
        format!(
            r#"{{"metadata":{{"title":"t","lesson":"l","estimated_duration":"5 min","cast":[]}},"scenes":[{}]}}"#,
            scenes.join(",")
        )
    }

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String>>>,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn llm_config() -> LlmConfig {
        LlmConfig {
            provider: "deepseek".to_string(),
            retry_count: 3,
            retry_delay_seconds: 0,
            deepseek: None,
            ollama: None,
        }
    }

    #[tokio::test]
    async fn parses_fenced_output() {
        let registry = Arc::new(CharacterRegistry::builtin(Path::new("assets")));
        let calls = Arc::new(Mutex::new(0));
        let llm = Box::new(ScriptedLlm {
            responses: Mutex::new(vec![Ok(format!("```json\n{}\n```", valid_script_json()))]),
            calls: calls.clone(),
        });
        let generator = NarrativeGenerator::new(llm, registry, None, &llm_config());

        let doc = generator.generate("ser honesto").await.unwrap();
        assert_eq!(doc.scenes.len(), 5);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn retries_after_invalid_json() {
        let registry = Arc::new(CharacterRegistry::builtin(Path::new("assets")));
        let calls = Arc::new(Mutex::new(0));
        let llm = Box::new(ScriptedLlm {
            responses: Mutex::new(vec![
                Ok("this is not json".to_string()),
                Ok(valid_script_json()),
            ]),
            calls: calls.clone(),
        });
        let generator = NarrativeGenerator::new(llm, registry, None, &llm_config());

        let doc = generator.generate("compartir").await.unwrap();
        assert_eq!(doc.scenes.len(), 5);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let registry = Arc::new(CharacterRegistry::builtin(Path::new("assets")));
        let calls = Arc::new(Mutex::new(0));
        let llm = Box::new(ScriptedLlm {
            responses: Mutex::new(vec![
                Err(anyhow!("timeout")),
                Err(anyhow!("timeout")),
                Err(anyhow!("timeout")),
            ]),
            calls: calls.clone(),
        });
        let generator = NarrativeGenerator::new(llm, registry, None, &llm_config());

        assert!(generator.generate("respetar").await.is_err());
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn script_with_unknown_speaker_is_discarded() {
        let registry = Arc::new(CharacterRegistry::builtin(Path::new("assets")));
        let bad = valid_script_json().replace("\"Lucas\"", "\"Gandalf\"");
        let calls = Arc::new(Mutex::new(0));
        let llm = Box::new(ScriptedLlm {
            responses: Mutex::new(vec![Ok(bad), Ok(valid_script_json())]),
            calls: calls.clone(),
        });
        let generator = NarrativeGenerator::new(llm, registry, None, &llm_config());

        let doc = generator.generate("escuchar").await.unwrap();
        assert_eq!(doc.scenes.len(), 5);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn prompt_carries_moral_and_profile_priority() {
        let registry = Arc::new(CharacterRegistry::builtin(Path::new("assets")));
        let llm = Box::new(ScriptedLlm {
            responses: Mutex::new(vec![]),
            calls: Arc::new(Mutex::new(0)),
        });
        let profile = UserProfile {
            age: 6,
            level: "simple".to_string(),
            style: Some("aventura".to_string()),
            topics: vec!["animales".to_string()],
        };
        let generator = NarrativeGenerator::new(llm, registry, Some(profile), &llm_config());

        let prompt = generator.build_prompt("decir la verdad");
        assert!(prompt.contains("decir la verdad"));
        assert!(prompt.contains("PRIORITARIA"));
        assert!(prompt.contains("aventura"));
        assert!(prompt.contains("Martina"));
    }
}
