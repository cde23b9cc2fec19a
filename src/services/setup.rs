use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::core::io::Storage;
use crate::services::characters::{CharacterRef, CharacterRegistry};
use crate::services::image::ImageClient;

/// Generates any missing character reference image before the first run.
///
/// The references anchor every illustration prompt, so a fresh install must
/// have all five on disk before stage 3 can keep the cast coherent. Images
/// already present are passed along as style references, so a late addition
/// comes out in the established look. Returns how many were generated.
pub async fn ensure_character_references(
    registry: &CharacterRegistry,
    image: &Arc<dyn ImageClient>,
    storage: &Arc<dyn Storage>,
) -> Result<usize> {
    let mut style_references: Vec<Vec<u8>> = Vec::new();
    let mut missing: Vec<&CharacterRef> = Vec::new();

    for character in registry.all() {
        let path = character.reference_image_path.to_string_lossy().to_string();
        if storage.exists(&path).await? {
            style_references.push(storage.read(&path).await?);
        } else {
            missing.push(character);
        }
    }

    for character in &missing {
        info!("Generando referencia de {}...", character.display_name);
        let png = image
            .generate(&reference_prompt(character), &style_references)
            .await
            .with_context(|| {
                format!("reference image for {} could not be generated", character.display_name)
            })?;
        let path = character.reference_image_path.to_string_lossy().to_string();
        storage.write(&path, &png).await?;
        style_references.push(png);
    }

    Ok(missing.len())
}

fn reference_prompt(character: &CharacterRef) -> String {
    format!(
        "Genera una imagen de referencia de personaje para cuento infantil:\n\n\
{}\n{}\n\n\
IMPORTANTE:\n\
- Vista frontal, cuerpo completo\n\
- Fondo blanco simple\n\
- Estilo: ilustración infantil colorida, amigable, educativa\n\
- NO incluir texto ni diálogos\n\
- Expresión amigable\n",
        character.display_name.to_uppercase(),
        character.detailed_physical_description
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct RecordingImage {
        reference_counts: Mutex<Vec<usize>>,
    }

    impl RecordingImage {
        fn new() -> Self {
            Self {
                reference_counts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageClient for RecordingImage {
        async fn generate(&self, _prompt: &str, references: &[Vec<u8>]) -> Result<Vec<u8>> {
            self.reference_counts.lock().unwrap().push(references.len());
            Ok(b"PNGDATA".to_vec())
        }
    }

    struct BrokenImage;

    #[async_trait]
    impl ImageClient for BrokenImage {
        async fn generate(&self, _prompt: &str, _references: &[Vec<u8>]) -> Result<Vec<u8>> {
            Err(anyhow!("image service down"))
        }
    }

    #[tokio::test]
    async fn generates_only_missing_references() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CharacterRegistry::builtin(dir.path());
        let characters_dir = dir.path().join("characters");
        std::fs::create_dir_all(&characters_dir).unwrap();
        std::fs::write(characters_dir.join("lucas_referencia.png"), b"lucas").unwrap();
        std::fs::write(characters_dir.join("sofia_referencia.png"), b"sofia").unwrap();

        let client = Arc::new(RecordingImage::new());
        let image: Arc<dyn ImageClient> = client.clone();
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

        let generated = ensure_character_references(&registry, &image, &storage)
            .await
            .unwrap();
        assert_eq!(generated, 3);
        for id in ["carlos", "juan", "martina"] {
            assert!(characters_dir.join(format!("{id}_referencia.png")).exists());
        }

        // Each new reference joins the style pool for the next one.
        let counts = client.reference_counts.lock().unwrap();
        assert_eq!(*counts, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn complete_set_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CharacterRegistry::builtin(dir.path());
        let characters_dir = dir.path().join("characters");
        std::fs::create_dir_all(&characters_dir).unwrap();
        for character in registry.all() {
            std::fs::write(&character.reference_image_path, b"png").unwrap();
        }

        let client = Arc::new(RecordingImage::new());
        let image: Arc<dyn ImageClient> = client.clone();
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

        let generated = ensure_character_references(&registry, &image, &storage)
            .await
            .unwrap();
        assert_eq!(generated, 0);
        assert!(client.reference_counts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CharacterRegistry::builtin(dir.path());
        let image: Arc<dyn ImageClient> = Arc::new(BrokenImage);
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

        let err = ensure_character_references(&registry, &image, &storage)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Lucas"), "got: {err:#}");
        assert!(!dir.path().join("characters/lucas_referencia.png").exists());
    }

    #[test]
    fn prompt_carries_canonical_description() {
        let registry = CharacterRegistry::builtin(Path::new("assets"));
        let martina = registry.all().iter().find(|c| c.display_name == "Martina").unwrap();
        let prompt = reference_prompt(martina);
        assert!(prompt.contains("MARTINA"));
        assert!(prompt.contains("bata blanca de doctora"));
        assert!(prompt.contains("Fondo blanco simple"));
    }
}
