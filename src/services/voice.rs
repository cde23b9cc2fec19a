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
use crate::services::speech::SpeechClient;

/// Stage 2: one narration clip per scene.
///
/// Scene failures never abort the stage; a failed scene gets an empty
/// placeholder file so downstream numbering stays contiguous, and the run
/// finishes silent for that scene.
pub struct VoiceSynthesizer {
    speech: Arc<dyn SpeechClient>,
    voices: HashMap<CharacterId, String>,
    storage: Arc<dyn Storage>,
    max_concurrency: usize,
}

impl VoiceSynthesizer {
    pub fn new(
        speech: Arc<dyn SpeechClient>,
        registry: &CharacterRegistry,
        configured_voices: &HashMap<String, String>,
        storage: Arc<dyn Storage>,
        max_concurrency: usize,
    ) -> Self {
        let mut voices = HashMap::new();
        for character in registry.all() {
            if let Some(voice_id) = configured_voices.get(character.id.as_str()) {
                voices.insert(character.id, voice_id.clone());
            }
        }
        Self {
            speech,
            voices,
            storage,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Synthesizes all scenes into `audio_dir/dialogue_<n>.mp3`, in parallel
    /// up to the configured limit. Returns one asset per scene, ordered by
    /// scene number.
    pub async fn synthesize_all(
        &self,
        scenes: &[Scene],
        registry: &CharacterRegistry,
        audio_dir: &Path,
    ) -> Result<Vec<Asset>> {
        let bar = ProgressBar::new(scenes.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} audio {msg}")?
                .progress_chars("#>-"),
        );

        let mut assets: Vec<Asset> = stream::iter(scenes.iter())
            .map(|scene| {
                let bar = bar.clone();
                async move {
                    let asset = self.synthesize_scene(scene, registry, audio_dir).await;
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

    async fn synthesize_scene(
        &self,
        scene: &Scene,
        registry: &CharacterRegistry,
        audio_dir: &Path,
    ) -> Asset {
        let path = audio_dir.join(format!("dialogue_{}.mp3", scene.number));
        let path_str = path.to_string_lossy().to_string();

        // Resume support. An existing non-empty clip is kept as-is.
        if let Ok(Some(existing)) = self.existing_clip(&path_str).await {
            if existing {
                return Asset::ok(AssetKind::Audio, scene.number, path);
            }
        }

        let result = self.try_synthesize(scene, registry).await;
        match result {
            Ok(audio) => match self.storage.write(&path_str, &audio).await {
                Ok(()) => Asset::ok(AssetKind::Audio, scene.number, path),
                Err(e) => {
                    warn!("scene {} audio write failed: {e}", scene.number);
                    self.placeholder(scene.number, path, format!("write failed: {e}"))
                        .await
                }
            },
            Err(reason) => {
                warn!("scene {} audio degraded: {reason}", scene.number);
                self.placeholder(scene.number, path, reason).await
            }
        }
    }

    async fn try_synthesize(
        &self,
        scene: &Scene,
        registry: &CharacterRegistry,
    ) -> std::result::Result<Vec<u8>, String> {
        let character = registry
            .lookup(&scene.dialogue.character)
            .map_err(|e| e.to_string())?;
        let voice_id = self
            .voices
            .get(&character)
            .ok_or_else(|| format!("no voice configured for {}", character.as_str()))?;

        // The emotion rides along as a bracketed performance hint.
        let text = if scene.dialogue.emotion.trim().is_empty() {
            scene.dialogue.text.clone()
        } else {
            format!("[{}] {}", scene.dialogue.emotion.trim(), scene.dialogue.text)
        };

        self.speech
            .synthesize(&text, voice_id)
            .await
            .map_err(|e| format!("{e:#}"))
    }

    async fn existing_clip(&self, path: &str) -> Result<Option<bool>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let content = self.storage.read(path).await?;
        Ok(Some(!content.is_empty()))
    }

    async fn placeholder(
        &self,
        scene_number: u32,
        path: std::path::PathBuf,
        reason: String,
    ) -> Asset {
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self.storage.write(&path_str, &[]).await {
            warn!("scene {scene_number} placeholder write failed: {e}");
        }
        Asset::placeholder(AssetKind::Audio, scene_number, path, reason)
    }
}
