use anyhow::{Context, Result};
use log::{error, info};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::script::ScriptDocument;
use crate::core::state::{Asset, PipelineRun, RunStatus, RunStore};
use crate::services::assembly::VideoAssembler;
use crate::services::characters::CharacterRegistry;
use crate::services::illustration::IllustrationGenerator;
use crate::services::narrative::NarrativeGenerator;
use crate::services::voice::VoiceSynthesizer;

/// Orchestrates the four stages of one run.
///
/// Stage 1 and stage 4 failures end the run; stages 2 and 3 absorb their
/// per-scene failures and always hand a full asset list forward.
pub struct WorkflowManager {
    config: Config,
    registry: Arc<CharacterRegistry>,
    narrative: NarrativeGenerator,
    voices: VoiceSynthesizer,
    illustrations: IllustrationGenerator,
    assembler: VideoAssembler,
    runs: RunStore,
    storage: Arc<dyn Storage>,
}

impl WorkflowManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<CharacterRegistry>,
        narrative: NarrativeGenerator,
        voices: VoiceSynthesizer,
        illustrations: IllustrationGenerator,
        assembler: VideoAssembler,
        runs: RunStore,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            config,
            registry,
            narrative,
            voices,
            illustrations,
            assembler,
            runs,
            storage,
        }
    }

    pub fn run_store(&self) -> RunStore {
        self.runs.clone()
    }

    pub async fn run(&self, moral: &str) -> Result<PipelineRun> {
        self.run_with_id(moral, &new_run_id()).await
    }

    /// Executes the pipeline under a caller-chosen run id. Reusing the id of
    /// an interrupted run resumes it: existing script and assets are kept.
    pub async fn run_with_id(&self, moral: &str, run_id: &str) -> Result<PipelineRun> {
        self.runs
            .insert(PipelineRun::new(run_id.to_string(), moral.to_string()));

        let result = self.execute(moral, run_id).await;
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                error!("run {run_id} failed: {e:#}");
                self.runs
                    .update(run_id, |run| {
                        run.status = RunStatus::Error;
                        run.current_step = "Error".to_string();
                        run.error_detail = Some(format!("{e:#}"));
                    })
                    .context("run vanished from store")?
            }
        };

        self.persist_snapshot(&run, run_id).await;
        self.print_summary(&run);
        Ok(run)
    }

    async fn execute(&self, moral: &str, run_id: &str) -> Result<PipelineRun> {
        let run_dir = self.config.run_dir(run_id);

        self.checkpoint(run_id, 20, "Generando guion personalizado...");
        let script = self.obtain_script(moral, &run_dir).await?;
        info!(
            "Guion listo: \"{}\" ({} escenas)",
            script.metadata.title,
            script.scenes.len()
        );

        self.checkpoint(run_id, 30, "Generando voces...");
        let audio = self
            .voices
            .synthesize_all(&script.scenes, &self.registry, &run_dir.join("audio"))
            .await?;

        self.record_degradation(run_id, &audio, &[]);

        self.checkpoint(run_id, 50, "Generando imágenes...");
        let images = self
            .illustrations
            .generate_all(&script.scenes, &self.registry, &run_dir.join("images"))
            .await?;
        self.record_degradation(run_id, &audio, &images);

        self.checkpoint(run_id, 90, "Ensamblando video...");
        let output_path = output_video_path(&self.config, run_id);
        let report = self
            .assembler
            .assemble(&script.scenes, &audio, &images, &run_dir, &output_path)
            .await?;

        let run = self
            .runs
            .update(run_id, |run| {
                run.status = RunStatus::Completed;
                run.current_step = "Completado - Video generado".to_string();
                run.progress_percent = 100;
                run.video_path = Some(report.video_path.clone());
                run.rendered_scenes = report.rendered_scenes;
            })
            .context("run vanished from store")?;
        Ok(run)
    }

    /// Reloads a cached script when present, otherwise generates one.
    /// A cache hit skips stage 1 entirely, retries included.
    async fn obtain_script(&self, moral: &str, run_dir: &Path) -> Result<ScriptDocument> {
        let script_path = run_dir.join("script.json");
        let script_path_str = script_path.to_string_lossy().to_string();

        if self.storage.exists(&script_path_str).await? {
            let raw = self.storage.read(&script_path_str).await?;
            let script: ScriptDocument =
                serde_json::from_slice(&raw).context("cached script.json is corrupt")?;
            script
                .validate(&self.registry)
                .map_err(|e| PipelineError::ContractViolation(format!("cached script: {e}")))?;
            info!("Reutilizando guion de {}", script_path.display());
            return Ok(script);
        }

        let script = self.narrative.generate(moral).await?;
        let raw = serde_json::to_vec_pretty(&script)?;
        self.storage.write(&script_path_str, &raw).await?;
        Ok(script)
    }

    /// Folds stage 2/3 degradation into the run record as it happens, so a
    /// later fatal error still reports how far the assets got.
    fn record_degradation(&self, run_id: &str, audio: &[Asset], images: &[Asset]) {
        let degraded = degraded_scene_count(audio, images);
        self.runs.update(run_id, |run| {
            run.degraded_scenes = degraded;
        });
    }

    fn checkpoint(&self, run_id: &str, percent: u8, step: &str) {
        info!("[{percent}%] {step}");
        self.runs.update(run_id, |run| {
            run.progress_percent = percent;
            run.current_step = step.to_string();
        });
    }

    async fn persist_snapshot(&self, run: &PipelineRun, run_id: &str) {
        let path = self.config.run_dir(run_id).join("run.json");
        match serde_json::to_vec_pretty(run) {
            Ok(raw) => {
                if let Err(e) = self.storage.write(&path.to_string_lossy(), &raw).await {
                    error!("run snapshot write failed: {e}");
                }
            }
            Err(e) => error!("run snapshot serialization failed: {e}"),
        }
    }

    fn print_summary(&self, run: &PipelineRun) {
        match run.status {
            RunStatus::Completed => {
                println!(
                    "Video generado: {}",
                    run.video_path
                        .as_deref()
                        .unwrap_or(Path::new("?"))
                        .display()
                );
                println!(
                    "Escenas renderizadas: {} (degradadas: {})",
                    run.rendered_scenes, run.degraded_scenes
                );
            }
            _ => {
                println!(
                    "La generación falló: {}",
                    run.error_detail.as_deref().unwrap_or("motivo desconocido")
                );
                println!(
                    "Escenas renderizadas: {} (degradadas: {})",
                    run.rendered_scenes, run.degraded_scenes
                );
            }
        }
    }
}

/// Scenes where at least one asset degraded.
fn degraded_scene_count(audio: &[Asset], images: &[Asset]) -> usize {
    let mut degraded: Vec<u32> = audio
        .iter()
        .chain(images.iter())
        .filter(|a| !a.is_ok())
        .map(|a| a.scene_number)
        .collect();
    degraded.sort_unstable();
    degraded.dedup();
    degraded.len()
}

fn new_run_id() -> String {
    let mut rng = rand::rng();
    (0..8)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

pub fn output_video_path(config: &Config, run_id: &str) -> PathBuf {
    Path::new(&config.output_folder).join(format!("video_{run_id}.mp4"))
}
