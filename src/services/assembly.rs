use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::script::Scene;
use crate::core::state::{Asset, AssetKind};
use crate::services::scenario::ScenarioTag;
use crate::utils::ffmpeg::{check_ffmpeg, check_ffprobe, probe_duration, FfmpegCommand, FfmpegRunner};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssemblyConfig {
    /// Silence before the dialogue starts, seconds.
    #[serde(default = "default_dialog_delay")]
    pub dialog_delay: f64,
    /// Visual and audio fade at each clip boundary, seconds.
    #[serde(default = "default_fade")]
    pub fade_duration: f64,
    #[serde(default = "default_ambient_volume")]
    pub ambient_volume: f64,
    #[serde(default = "default_music_volume")]
    pub music_volume: f64,
    /// Optional full-length background music file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_track: Option<PathBuf>,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_ffmpeg_timeout")]
    pub ffmpeg_timeout_secs: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            dialog_delay: default_dialog_delay(),
            fade_duration: default_fade(),
            ambient_volume: default_ambient_volume(),
            music_volume: default_music_volume(),
            music_track: None,
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            ffmpeg_timeout_secs: default_ffmpeg_timeout(),
        }
    }
}

fn default_dialog_delay() -> f64 {
    0.8
}
fn default_fade() -> f64 {
    0.5
}
fn default_ambient_volume() -> f64 {
    0.3
}
fn default_music_volume() -> f64 {
    0.15
}
fn default_fps() -> u32 {
    24
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_ffmpeg_timeout() -> u64 {
    600
}

/// Duration of one clip: lead-in silence, then the narration, then the
/// fade-out tail. A silent scene still gets the delay and fade envelope.
pub fn clip_duration(voice_duration: f64, config: &AssemblyConfig) -> f64 {
    config.dialog_delay + voice_duration + config.fade_duration
}

/// Render plan for one scene.
#[derive(Debug, Clone)]
pub struct ScenePlan {
    pub scene_number: u32,
    pub image_path: PathBuf,
    pub voice_path: Option<PathBuf>,
    pub scenario: Option<ScenarioTag>,
    pub duration: f64,
}

/// Decides which scenes render and how long each clip runs.
///
/// A scene without a usable image cannot render and is dropped; a scene
/// without usable audio renders silent. Zero renderable scenes is the one
/// whole-run failure of this stage.
pub fn plan_scenes(
    scenes: &[Scene],
    audio: &[Asset],
    images: &[Asset],
    voice_durations: &HashMap<u32, f64>,
    config: &AssemblyConfig,
) -> Result<Vec<ScenePlan>, PipelineError> {
    let audio_by_scene: HashMap<u32, &Asset> = audio
        .iter()
        .filter(|a| a.kind == AssetKind::Audio)
        .map(|a| (a.scene_number, a))
        .collect();
    let image_by_scene: HashMap<u32, &Asset> = images
        .iter()
        .filter(|a| a.kind == AssetKind::Image)
        .map(|a| (a.scene_number, a))
        .collect();

    let mut plans = Vec::new();
    for scene in scenes {
        let image = match image_by_scene.get(&scene.number) {
            Some(asset) if asset.is_ok() => asset,
            _ => {
                warn!("scene {} has no usable image, skipping", scene.number);
                continue;
            }
        };

        // A clip the probe could not time is treated as absent; muxing it
        // into the minimal envelope would cut the narration mid-word.
        let voice = audio_by_scene
            .get(&scene.number)
            .filter(|a| a.is_ok())
            .and_then(|a| {
                voice_durations
                    .get(&scene.number)
                    .map(|d| (a.file_path.clone(), *d))
            });
        let (voice_path, voice_duration) = match voice {
            Some((path, duration)) => (Some(path), duration),
            None => (None, 0.0),
        };

        plans.push(ScenePlan {
            scene_number: scene.number,
            image_path: image.file_path.clone(),
            voice_path,
            scenario: ScenarioTag::classify(&scene.image_description),
            duration: clip_duration(voice_duration, config),
        });
    }

    if plans.is_empty() {
        return Err(PipelineError::NoRenderableScenes {
            failed: scenes.len(),
            total: scenes.len(),
        });
    }
    Ok(plans)
}

/// Outcome of stage 4.
#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub video_path: PathBuf,
    pub rendered_scenes: usize,
    pub skipped_scenes: usize,
    pub total_duration: f64,
}

/// Stage 4: renders per-scene clips, concatenates them and optionally lays
/// a music bed underneath.
pub struct VideoAssembler {
    config: AssemblyConfig,
    runner: FfmpegRunner,
    storage: Arc<dyn Storage>,
    sounds_dir: PathBuf,
}

impl VideoAssembler {
    pub fn new(config: AssemblyConfig, storage: Arc<dyn Storage>, sounds_dir: PathBuf) -> Self {
        let runner = FfmpegRunner::new(config.ffmpeg_timeout_secs);
        Self {
            config,
            runner,
            storage,
            sounds_dir,
        }
    }

    pub async fn assemble(
        &self,
        scenes: &[Scene],
        audio: &[Asset],
        images: &[Asset],
        run_dir: &Path,
        output_path: &Path,
    ) -> Result<AssemblyReport, PipelineError> {
        // The renderability verdict precedes any tool lookup so a fully
        // degraded run reports the real cause, not a missing binary.
        let renderable = images.iter().filter(|a| a.is_ok()).count();
        if renderable == 0 {
            return Err(PipelineError::NoRenderableScenes {
                failed: scenes.len(),
                total: scenes.len(),
            });
        }

        check_ffmpeg()?;
        check_ffprobe()?;

        let mut voice_durations = HashMap::new();
        for asset in audio.iter().filter(|a| a.is_ok()) {
            match probe_duration(&asset.file_path).await {
                Ok(d) => {
                    voice_durations.insert(asset.scene_number, d);
                }
                Err(e) => {
                    warn!(
                        "scene {} audio unprobeable, rendering silent: {e:#}",
                        asset.scene_number
                    );
                }
            }
        }

        let plans = plan_scenes(scenes, audio, images, &voice_durations, &self.config)?;
        let total_duration: f64 = plans.iter().map(|p| p.duration).sum();

        let clips_dir = run_dir.join("clips");
        let mut clip_paths = Vec::new();
        for plan in &plans {
            let clip_path = clips_dir.join(format!("scene_{}.mp4", plan.scene_number));
            info!(
                "Renderizando escena {} ({:.1}s)",
                plan.scene_number, plan.duration
            );
            self.render_clip(plan, &clip_path).await?;
            clip_paths.push(clip_path);
        }

        self.concat(&clip_paths, run_dir, output_path, total_duration)
            .await?;

        // Intermediates are per-run scratch; the library assets stay.
        for clip in &clip_paths {
            if let Err(e) = self.storage.delete(&clip.to_string_lossy()).await {
                warn!("clip cleanup failed: {e}");
            }
        }

        info!(
            "Video de {total_duration:.1}s con {} escenas",
            plans.len()
        );
        Ok(AssemblyReport {
            video_path: output_path.to_path_buf(),
            rendered_scenes: plans.len(),
            skipped_scenes: scenes.len() - plans.len(),
            total_duration,
        })
    }

    async fn render_clip(&self, plan: &ScenePlan, clip_path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = clip_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::AssemblyFailure(e.to_string()))?;
        }

        let duration = plan.duration;
        let mut cmd = FfmpegCommand::new(clip_path)
            .input(&plan.image_path, ["-loop", "1"])
            // Silent base track anchors amix to the exact clip length.
            .input(
                "anullsrc=channel_layout=stereo:sample_rate=44100",
                vec![
                    "-f".to_string(),
                    "lavfi".to_string(),
                    "-t".to_string(),
                    format!("{duration:.3}"),
                ],
            );

        let mut filters = vec![self.video_filter(duration)];
        let mut audio_labels = vec!["[1:a]".to_string()];
        let mut input_index = 2;

        if let Some(voice) = &plan.voice_path {
            cmd = cmd.input(voice, Vec::<String>::new());
            let delay_ms = (self.config.dialog_delay * 1000.0).round() as u64;
            filters.push(format!("[{input_index}:a]adelay={delay_ms}|{delay_ms}[voz]"));
            audio_labels.push("[voz]".to_string());
            input_index += 1;
        }

        if let Some(ambient) = self.ambient_path(plan) {
            cmd = cmd.input(&ambient, ["-stream_loop", "-1"]);
            let fade = self.config.fade_duration;
            let fade_start = (duration - fade).max(0.0);
            filters.push(format!(
                "[{input_index}:a]volume={:.2},afade=t=in:st=0:d={fade:.3},afade=t=out:st={fade_start:.3}:d={fade:.3}[amb]",
                self.config.ambient_volume
            ));
            audio_labels.push("[amb]".to_string());
        }

        filters.push(format!(
            "{}amix=inputs={}:duration=first:dropout_transition=0[a]",
            audio_labels.concat(),
            audio_labels.len()
        ));

        let cmd = cmd
            .filter_complex(filters.join(";"))
            .output_args(["-map", "[v]", "-map", "[a]"])
            .output_args(["-c:v", "libx264", "-preset", "medium", "-pix_fmt", "yuv420p"])
            .output_args(vec!["-r".to_string(), self.config.fps.to_string()])
            .output_args(["-c:a", "aac", "-b:a", "192k"])
            .duration(duration);

        self.runner
            .run(&cmd)
            .await
            .map_err(|e| PipelineError::AssemblyFailure(format!("{e:#}")))
    }

    fn video_filter(&self, duration: f64) -> String {
        let (w, h) = (self.config.width, self.config.height);
        let fade = self.config.fade_duration;
        let fade_out_start = (duration - fade).max(0.0);
        format!(
            "[0:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,\
fade=t=in:st=0:d={fade:.3},fade=t=out:st={fade_out_start:.3}:d={fade:.3}[v]"
        )
    }

    fn ambient_path(&self, plan: &ScenePlan) -> Option<PathBuf> {
        let tag = plan.scenario?;
        let path = self.sounds_dir.join(format!("{}.mp3", tag.as_str()));
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    async fn concat(
        &self,
        clips: &[PathBuf],
        run_dir: &Path,
        output_path: &Path,
        total_duration: f64,
    ) -> Result<(), PipelineError> {
        let list_path = run_dir.join("clips").join("concat.txt");
        let list = clips
            .iter()
            .map(|c| format!("file '{}'\n", c.to_string_lossy()))
            .collect::<String>();
        self.storage
            .write(&list_path.to_string_lossy(), list.as_bytes())
            .await
            .map_err(|e| PipelineError::AssemblyFailure(e.to_string()))?;

        let needs_music = self
            .config
            .music_track
            .as_ref()
            .is_some_and(|t| t.exists());
        let concat_target: PathBuf = if needs_music {
            run_dir.join("video_raw.mp4")
        } else {
            output_path.to_path_buf()
        };

        let cmd = FfmpegCommand::new(&concat_target)
            .input(&list_path, ["-f", "concat", "-safe", "0"])
            .output_args(["-c", "copy"]);
        self.runner
            .run(&cmd)
            .await
            .map_err(|e| PipelineError::AssemblyFailure(format!("{e:#}")))?;

        if needs_music {
            let music = self.config.music_track.as_ref().unwrap();
            let fade = self.config.fade_duration;
            let fade_start = (total_duration - fade).max(0.0);
            let cmd = FfmpegCommand::new(output_path)
                .input(&concat_target, Vec::<String>::new())
                .input(music, ["-stream_loop", "-1"])
                .filter_complex(format!(
                    "[1:a]volume={:.2},afade=t=in:st=0:d={fade:.3},afade=t=out:st={fade_start:.3}:d={fade:.3}[m];\
[0:a][m]amix=inputs=2:duration=first:dropout_transition=0[a]",
                    self.config.music_volume
                ))
                .output_args(["-map", "0:v", "-map", "[a]"])
                .output_args(["-c:v", "copy", "-c:a", "aac", "-b:a", "192k"]);
            self.runner
                .run(&cmd)
                .await
                .map_err(|e| PipelineError::AssemblyFailure(format!("{e:#}")))?;

            if let Err(e) = self.storage.delete(&concat_target.to_string_lossy()).await {
                warn!("raw video cleanup failed: {e}");
            }
        }

        if let Err(e) = self.storage.delete(&list_path.to_string_lossy()).await {
            warn!("concat list cleanup failed: {e}");
        }
        Ok(())
    }
}
