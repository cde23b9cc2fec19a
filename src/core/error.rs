use thiserror::Error;

/// Failure taxonomy of the pipeline.
///
/// Per-scene failures (`AssetGenerationFailure`, `ScenarioResolutionFailure`)
/// are recovered inside their owning stage and never escalate to the
/// orchestrator. The remaining variants terminate the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("script contract violation: {0}")]
    ContractViolation(String),

    #[error("unknown character '{0}': not in the fixed registry")]
    UnknownCharacter(String),

    #[error("scene {scene}: {kind} generation failed: {reason}")]
    AssetGenerationFailure {
        scene: u32,
        kind: &'static str,
        reason: String,
    },

    #[error("scenario reference generation failed: {0}")]
    ScenarioResolutionFailure(String),

    #[error("no renderable scenes: {failed} of {total} scenes failed")]
    NoRenderableScenes { failed: usize, total: usize },

    #[error("video assembly failed: {0}")]
    AssemblyFailure(String),

    #[error("ffmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("ffprobe not found in PATH")]
    FfprobeNotFound,
}
