use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::io::Storage;
use crate::core::script::Scene;
use crate::core::state::{Asset, AssetKind};
use crate::services::characters::{CharacterId, CharacterRegistry};
use crate::services::image::ImageClient;
use crate::services::scenario::{ScenarioLibrary, ScenarioTag};

/// Stage 3: one illustration per scene.
///
/// Every scene prompt carries the full story cast with their fixed physical
/// descriptions plus the same reference images, so characters keep identical
/// appearance across the whole video. Failures degrade per scene.
pub struct IllustrationGenerator {
    image: Arc<dyn ImageClient>,
    scenarios: Arc<ScenarioLibrary>,
    storage: Arc<dyn Storage>,
    max_concurrency: usize,
}

impl IllustrationGenerator {
    pub fn new(
        image: Arc<dyn ImageClient>,
        scenarios: Arc<ScenarioLibrary>,
        storage: Arc<dyn Storage>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            image,
            scenarios,
            storage,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Generates all scene images into `images_dir/image_<n>.png`. Returns
    /// one asset per scene ordered by scene number.
    pub async fn generate_all(
        &self,
        scenes: &[Scene],
        registry: &CharacterRegistry,
        images_dir: &Path,
    ) -> Result<Vec<Asset>> {
        let cast = registry.cast_in(scenes)?;

        // Resolve every distinct scenario up-front. resolve() serializes
        // internally, so doing it before the parallel scene loop keeps each
        // background generated exactly once.
        let mut backgrounds: HashMap<ScenarioTag, Vec<u8>> = HashMap::new();
        for scene in scenes {
            if let Some(tag) = ScenarioTag::classify(&scene.image_description) {
                if backgrounds.contains_key(&tag) {
                    continue;
                }
                if let Some(path) = self.scenarios.resolve(tag, &scene.image_description).await {
                    match self.storage.read(&path.to_string_lossy()).await {
                        Ok(bytes) => {
                            backgrounds.insert(tag, bytes);
                        }
                        Err(e) => warn!("scenario {} unreadable: {e}", tag.as_str()),
                    }
                }
            }
        }

        let references = self.load_character_references(&cast, registry).await;

        let bar = ProgressBar::new(scenes.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} imagen {msg}")?
                .progress_chars("#>-"),
        );

        let mut assets: Vec<Asset> = stream::iter(scenes.iter())
            .map(|scene| {
                let bar = bar.clone();
                let backgrounds = &backgrounds;
                let references = &references;
                let cast = &cast;
                async move {
                    let asset = self
                        .generate_scene(scene, cast, registry, references, backgrounds, images_dir)
                        .await;
                    bar.inc(1);
                    asset
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        bar.finish_and_clear();

        assets.sort_by_key(|a| a.scene_number);
        Ok(assets)
    }

    async fn load_character_references(
        &self,
        cast: &[CharacterId],
        registry: &CharacterRegistry,
    ) -> Vec<Vec<u8>> {
        let mut references = Vec::new();
        for id in cast {
            let character = registry.get(*id);
            let path = character.reference_image_path.to_string_lossy().to_string();
            match self.storage.exists(&path).await {
                Ok(true) => match self.storage.read(&path).await {
                    Ok(bytes) => references.push(bytes),
                    Err(e) => warn!("reference image for {} unreadable: {e}", character.display_name),
                },
                _ => warn!(
                    "reference image for {} missing at {}",
                    character.display_name, path
                ),
            }
        }
        references
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_scene(
        &self,
        scene: &Scene,
        cast: &[CharacterId],
        registry: &CharacterRegistry,
        character_references: &[Vec<u8>],
        backgrounds: &HashMap<ScenarioTag, Vec<u8>>,
        images_dir: &Path,
    ) -> Asset {
        let path = images_dir.join(format!("image_{}.png", scene.number));
        let path_str = path.to_string_lossy().to_string();

        if let Ok(true) = self.storage.exists(&path_str).await {
            return Asset::ok(AssetKind::Image, scene.number, path);
        }

        let prompt = compose_prompt(scene, cast, registry);

        let mut references: Vec<Vec<u8>> = character_references.to_vec();
        if let Some(tag) = ScenarioTag::classify(&scene.image_description) {
            if let Some(background) = backgrounds.get(&tag) {
                references.push(background.clone());
            }
        }

        match self.image.generate(&prompt, &references).await {
            Ok(bytes) => match self.storage.write(&path_str, &bytes).await {
                Ok(()) => Asset::ok(AssetKind::Image, scene.number, path),
                Err(e) => {
                    warn!("scene {} image write failed: {e}", scene.number);
                    Asset::placeholder(
                        AssetKind::Image,
                        scene.number,
                        path,
                        format!("write failed: {e}"),
                    )
                }
            },
            Err(e) => {
                warn!("scene {} image degraded: {e:#}", scene.number);
                Asset::placeholder(AssetKind::Image, scene.number, path, format!("{e:#}"))
            }
        }
    }
}

/// Builds the consistency-enforcing prompt. The whole cast appears with
/// exact descriptions in every scene, not only the current speaker.
fn compose_prompt(scene: &Scene, cast: &[CharacterId], registry: &CharacterRegistry) -> String {
    let descriptions = cast
        .iter()
        .map(|id| {
            let c = registry.get(*id);
            format!("- {}: {}", c.display_name, c.short_description)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let names = cast
        .iter()
        .map(|id| registry.get(*id).display_name)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "PERSONAJES QUE DEBEN APARECER EN LA IMAGEN:\n\
{descriptions}\n\
\n\
IMPORTANTE: La imagen DEBE incluir a TODOS estos personajes: {names}\n\
\n\
ESCENA:\n\
{}\n\
\n\
INSTRUCCIONES CRÍTICAS:\n\
- INCLUYE a {names} en la imagen\n\
- MANTÉN las características EXACTAS de cada personaje según las referencias visuales\n\
- Si hay referencia de escenario/background, MANTÉN el mismo estilo visual del lugar\n\
- NO cambies ropa, colores, peinados ni rasgos faciales de los personajes\n\
- NO incluir texto, diálogos ni viñetas en la imagen\n\
- Estilo: ilustración infantil colorida, amigable, educativa\n\
- Colores brillantes y alegres\n\
- Composición: personajes en primer plano, escenario de fondo",
        scene.image_description
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::script::Dialogue;
    use crate::core::state::AssetStatus;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeImage {
        fail_on: Option<&'static str>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ImageClient for FakeImage {
        async fn generate(&self, prompt: &str, references: &[Vec<u8>]) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), references.len()));
            if let Some(marker) = self.fail_on {
                if prompt.contains(marker) {
                    return Err(anyhow!("no image payload"));
                }
            }
            Ok(b"\x89PNGfake".to_vec())
        }
    }

    fn scene(number: u32, description: &str, speaker: &str) -> Scene {
        Scene {
            number,
            ambient_sound: String::new(),
            image_description: description.to_string(),
            dialogue: Dialogue {
                character: speaker.to_string(),
                text: "hola".to_string(),
                emotion: String::new(),
            },
        }
    }

    async fn library(dir: &Path, client: Arc<dyn ImageClient>) -> Arc<ScenarioLibrary> {
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        Arc::new(ScenarioLibrary::load(dir, client, storage).await.unwrap())
    }

    #[tokio::test]
    async fn generates_images_for_all_scenes() {
        let build = tempfile::tempdir().unwrap();
        let scenarios = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeImage {
            fail_on: None,
            calls: Mutex::new(vec![]),
        });
        let generator = IllustrationGenerator::new(
            client.clone(),
            library(scenarios.path(), client.clone()).await,
            Arc::new(NativeStorage::new()),
            2,
        );
        let registry = CharacterRegistry::builtin(Path::new("assets"));

        let scenes: Vec<Scene> = (1..=5)
            .map(|n| scene(n, "Lucas y Sofia en el parque", "Lucas"))
            .collect();
        let assets = generator
            .generate_all(&scenes, &registry, build.path())
            .await
            .unwrap();

        assert_eq!(assets.len(), 5);
        assert!(assets.iter().all(|a| a.status == AssetStatus::Ok));
        assert!(build.path().join("image_3.png").exists());
        // One background generation plus five scenes.
        assert_eq!(client.calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn partial_failure_degrades_only_failed_scene() {
        let build = tempfile::tempdir().unwrap();
        let scenarios = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeImage {
            fail_on: Some("tormenta"),
            calls: Mutex::new(vec![]),
        });
        let generator = IllustrationGenerator::new(
            client.clone(),
            library(scenarios.path(), client.clone()).await,
            Arc::new(NativeStorage::new()),
            2,
        );
        let registry = CharacterRegistry::builtin(Path::new("assets"));

        let mut scenes: Vec<Scene> = (1..=6)
            .map(|n| scene(n, "una habitación tranquila", "Sofia"))
            .collect();
        scenes[2].image_description = "una tormenta en la habitación".to_string();
        let assets = generator
            .generate_all(&scenes, &registry, build.path())
            .await
            .unwrap();

        assert_eq!(assets[2].status, AssetStatus::Placeholder);
        assert!(assets[2].detail.is_some());
        assert!(!assets[2].file_path.exists());
        let ok_count = assets.iter().filter(|a| a.is_ok()).count();
        assert_eq!(ok_count, 5);
    }

    #[tokio::test]
    async fn prompt_lists_full_cast_every_scene() {
        let build = tempfile::tempdir().unwrap();
        let scenarios = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeImage {
            fail_on: None,
            calls: Mutex::new(vec![]),
        });
        let generator = IllustrationGenerator::new(
            client.clone(),
            library(scenarios.path(), client.clone()).await,
            Arc::new(NativeStorage::new()),
            1,
        );
        let registry = CharacterRegistry::builtin(Path::new("assets"));

        // Martina only speaks in scene 5; she must still appear in scene 1's prompt.
        let mut scenes: Vec<Scene> = (1..=5)
            .map(|n| scene(n, "en un lugar sin escenario conocido", "Lucas"))
            .collect();
        scenes[4].dialogue.character = "Doctora Martina".to_string();
        generator
            .generate_all(&scenes, &registry, build.path())
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap();
        let scene_one_prompt = calls
            .iter()
            .find(|(p, _)| p.contains("sin escenario conocido"))
            .map(|(p, _)| p.clone())
            .unwrap();
        assert!(scene_one_prompt.contains("Martina"));
        assert!(scene_one_prompt.contains("bata blanca"));
        assert!(scene_one_prompt.contains("camisa azul celeste"));
    }

    #[tokio::test]
    async fn existing_image_is_kept() {
        let build = tempfile::tempdir().unwrap();
        let scenarios = tempfile::tempdir().unwrap();
        std::fs::write(build.path().join("image_1.png"), b"previous").unwrap();
        let client = Arc::new(FakeImage {
            fail_on: None,
            calls: Mutex::new(vec![]),
        });
        let generator = IllustrationGenerator::new(
            client.clone(),
            library(scenarios.path(), client.clone()).await,
            Arc::new(NativeStorage::new()),
            1,
        );
        let registry = CharacterRegistry::builtin(Path::new("assets"));

        let scenes = vec![scene(1, "sin lugar", "Lucas")];
        let assets = generator
            .generate_all(&scenes, &registry, build.path())
            .await
            .unwrap();

        assert_eq!(assets[0].status, AssetStatus::Ok);
        assert!(client.calls.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(build.path().join("image_1.png")).unwrap(), b"previous");
    }
}
