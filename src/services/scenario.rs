use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::io::Storage;
use crate::services::image::ImageClient;

/// The closed set of background locations stories can take place in.
///
/// Declaration order doubles as the classification tie-break: when a scene
/// description mentions several locations, the first matching tag wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioTag {
    #[serde(rename = "bosque")]
    Forest,
    #[serde(rename = "hospital")]
    Hospital,
    #[serde(rename = "plaza")]
    Plaza,
    #[serde(rename = "calle")]
    Street,
    #[serde(rename = "habitacion")]
    Bedroom,
    #[serde(rename = "sala_de_clases")]
    Classroom,
}

impl ScenarioTag {
    pub const ALL: [ScenarioTag; 6] = [
        ScenarioTag::Forest,
        ScenarioTag::Hospital,
        ScenarioTag::Plaza,
        ScenarioTag::Street,
        ScenarioTag::Bedroom,
        ScenarioTag::Classroom,
    ];

    /// File-name slug, also the key in the scenario database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioTag::Forest => "bosque",
            ScenarioTag::Hospital => "hospital",
            ScenarioTag::Plaza => "plaza",
            ScenarioTag::Street => "calle",
            ScenarioTag::Bedroom => "habitacion",
            ScenarioTag::Classroom => "sala_de_clases",
        }
    }

    /// Spanish substrings that classify a scene description to this tag.
    /// Matching is on the lowercased description.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            ScenarioTag::Forest => &["bosque", "árboles", "naturaleza", "selva", "monte", "floresta"],
            ScenarioTag::Hospital => &[
                "hospital",
                "clínica",
                "consultorio médico",
                "sala de emergencias",
                "enfermería",
            ],
            ScenarioTag::Plaza => &["plaza", "parque", "área pública", "zona verde", "espacio público"],
            ScenarioTag::Street => &["calle", "avenida", "vereda", "acera", "ciudad", "urbano", "camino"],
            ScenarioTag::Bedroom => &["habitación", "dormitorio", "cuarto", "pieza", "recámara"],
            ScenarioTag::Classroom => &[
                "sala de clases",
                "aula",
                "salón",
                "clase",
                "escuela",
                "colegio",
            ],
        }
    }

    /// Fixed background prompt. Stories vary, the backgrounds do not, so the
    /// generated reference can be reused across every future run.
    fn prompt_template(&self) -> &'static str {
        match self {
            ScenarioTag::Forest => "Bosque mágico chileno con árboles altos de troncos marrones, hojas verdes abundantes, rayos de sol filtrándose entre las ramas, helechos, flores silvestres de colores, camino de tierra, ambiente misterioso y acogedor. Ilustración de libro infantil, sin personas.",
            ScenarioTag::Hospital => "Interior de hospital infantil moderno y acogedor con paredes celestes o verde menta, camilla blanca, equipo médico básico organizado, ventana grande con luz natural, pósters educativos alegres en las paredes, ambiente limpio y tranquilizador. Ilustración de libro infantil, sin personas.",
            ScenarioTag::Plaza => "Plaza pública alegre y colorida con árboles grandes, bancas de madera verde, flores en maceteros, pasto verde brillante, caminos de baldosas, faroles decorativos, cielo azul con nubes, ambiente acogedor y familiar. Ilustración de libro infantil, sin personas.",
            ScenarioTag::Street => "Calle urbana chilena tranquila con casas coloridas, veredas amplias, árboles en las aceras, faroles, letreros de tiendas amigables, cielo azul, ambiente seguro y familiar. Ilustración de libro infantil, sin personas.",
            ScenarioTag::Bedroom => "Habitación infantil acogedora con cama con edredón colorido, ventana con cortinas alegres, estante con libros y juguetes, alfombra suave, lámpara de mesita, pósters en las paredes, ambiente cálido y seguro. Ilustración de libro infantil, sin personas.",
            ScenarioTag::Classroom => "Sala de clases infantil moderna con pizarra blanca o verde, escritorios pequeños de colores, estantes con libros y materiales educativos, ventanas grandes con luz natural, pósters educativos alegres en las paredes, mapas, números y letras decorativos. Ilustración de libro infantil, sin personas.",
        }
    }

    /// First tag whose keywords appear in the description, or None when the
    /// scene has no recognizable location.
    pub fn classify(description: &str) -> Option<ScenarioTag> {
        let description = description.to_lowercase();
        ScenarioTag::ALL.into_iter().find(|tag| {
            tag.keywords()
                .iter()
                .any(|keyword| description.contains(keyword))
        })
    }
}

/// One persisted scenario record in `scenarios.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioEntry {
    pub reference_image_path: PathBuf,
    pub source_description: String,
    pub auto_generated: bool,
}

/// Cross-run library of background reference images.
///
/// The entry map is guarded by an async mutex held across the whole
/// check-generate-persist sequence, so two scenes resolving the same tag
/// concurrently produce exactly one generation call.
pub struct ScenarioLibrary {
    db_path: PathBuf,
    scenarios_dir: PathBuf,
    image: Arc<dyn ImageClient>,
    storage: Arc<dyn Storage>,
    entries: Mutex<HashMap<ScenarioTag, ScenarioEntry>>,
}

impl ScenarioLibrary {
    pub async fn load(
        scenarios_dir: &Path,
        image: Arc<dyn ImageClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let db_path = scenarios_dir.join("scenarios.json");
        let entries = if storage.exists(&db_path.to_string_lossy()).await? {
            let raw = storage.read(&db_path.to_string_lossy()).await?;
            serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("scenarios.json unreadable, starting fresh: {e}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            db_path,
            scenarios_dir: scenarios_dir.to_path_buf(),
            image,
            storage,
            entries: Mutex::new(entries),
        })
    }

    /// Returns the reference image path for `tag`, generating and persisting
    /// it on first use. A generation failure is logged and surfaces as
    /// `None`; the caller degrades to character-only references.
    pub async fn resolve(&self, tag: ScenarioTag, example_description: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&tag) {
            let path = entry.reference_image_path.to_string_lossy().to_string();
            match self.storage.exists(&path).await {
                Ok(true) => {
                    info!("Reutilizando escenario: {}", tag.as_str());
                    return Some(entry.reference_image_path.clone());
                }
                // Stale record, the file was removed. Regenerate below.
                Ok(false) => {}
                Err(e) => {
                    warn!("scenario {} existence check failed: {e}", tag.as_str());
                    return None;
                }
            }
        }

        info!("Generando nuevo escenario: {}", tag.as_str());
        let path = self
            .scenarios_dir
            .join(format!("{}_background.png", tag.as_str()));

        let image = match self.image.generate(tag.prompt_template(), &[]).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("scenario {} generation failed: {e}", tag.as_str());
                return None;
            }
        };

        if let Err(e) = self.storage.write(&path.to_string_lossy(), &image).await {
            warn!("scenario {} write failed: {e}", tag.as_str());
            return None;
        }

        entries.insert(
            tag,
            ScenarioEntry {
                reference_image_path: path.clone(),
                source_description: if example_description.is_empty() {
                    format!("Escenario tipo {}", tag.as_str())
                } else {
                    example_description.to_string()
                },
                auto_generated: true,
            },
        );

        match serde_json::to_vec_pretty(&*entries) {
            Ok(raw) => {
                if let Err(e) = self
                    .storage
                    .write(&self.db_path.to_string_lossy(), &raw)
                    .await
                {
                    warn!("scenarios.json write failed: {e}");
                }
            }
            Err(e) => warn!("scenarios.json serialization failed: {e}"),
        }

        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn classifies_by_keyword() {
        assert_eq!(
            ScenarioTag::classify("Lucas juega en el parque con Sofia"),
            Some(ScenarioTag::Plaza)
        );
        assert_eq!(
            ScenarioTag::classify("La doctora Martina en su consultorio médico"),
            Some(ScenarioTag::Hospital)
        );
        assert_eq!(
            ScenarioTag::classify("Un Cuarto ordenado y luminoso"),
            Some(ScenarioTag::Bedroom)
        );
        assert_eq!(ScenarioTag::classify("Un lugar indeterminado"), None);
    }

    #[test]
    fn first_declared_tag_wins_on_ambiguity() {
        // Mentions both a forest and a street.
        assert_eq!(
            ScenarioTag::classify("caminando por la calle hacia el bosque"),
            Some(ScenarioTag::Forest)
        );
    }

    struct CountingImageClient {
        calls: StdMutex<usize>,
    }

    #[async_trait]
    impl ImageClient for CountingImageClient {
        async fn generate(&self, _prompt: &str, _references: &[Vec<u8>]) -> Result<Vec<u8>> {
            *self.calls.lock().unwrap() += 1;
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }

    struct FailingImageClient;

    #[async_trait]
    impl ImageClient for FailingImageClient {
        async fn generate(&self, _prompt: &str, _references: &[Vec<u8>]) -> Result<Vec<u8>> {
            Err(anyhow!("quota exceeded"))
        }
    }

    #[tokio::test]
    async fn generates_once_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(CountingImageClient {
            calls: StdMutex::new(0),
        });
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let library = ScenarioLibrary::load(dir.path(), client.clone(), storage)
            .await
            .unwrap();

        let first = library.resolve(ScenarioTag::Plaza, "en la plaza").await;
        let second = library.resolve(ScenarioTag::Plaza, "otra vez la plaza").await;

        assert_eq!(first, second);
        assert!(first.unwrap().exists());
        assert_eq!(*client.calls.lock().unwrap(), 1);
        assert!(dir.path().join("scenarios.json").exists());
    }

    #[tokio::test]
    async fn library_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        {
            let client = Arc::new(CountingImageClient {
                calls: StdMutex::new(0),
            });
            let library = ScenarioLibrary::load(dir.path(), client, storage.clone())
                .await
                .unwrap();
            library.resolve(ScenarioTag::Forest, "en el bosque").await;
        }

        // A fresh library backed by the same directory must not regenerate.
        let client = Arc::new(CountingImageClient {
            calls: StdMutex::new(0),
        });
        let library = ScenarioLibrary::load(dir.path(), client.clone(), storage)
            .await
            .unwrap();
        let path = library.resolve(ScenarioTag::Forest, "").await;
        assert!(path.is_some());
        assert_eq!(*client.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_generation_yields_none_and_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let library = ScenarioLibrary::load(dir.path(), Arc::new(FailingImageClient), storage)
            .await
            .unwrap();

        let path = library.resolve(ScenarioTag::Street, "en la calle").await;
        assert!(path.is_none());
        assert!(!dir.path().join("scenarios.json").exists());
    }
}
