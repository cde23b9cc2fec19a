use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One generated artifact of stage 2 or 3, consumed by stage 4.
/// Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub kind: AssetKind,
    pub scene_number: u32,
    pub file_path: PathBuf,
    pub status: AssetStatus,
    /// Degradation reason when status is not `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Asset {
    pub fn ok(kind: AssetKind, scene_number: u32, file_path: PathBuf) -> Self {
        Self {
            kind,
            scene_number,
            file_path,
            status: AssetStatus::Ok,
            detail: None,
        }
    }

    pub fn placeholder(
        kind: AssetKind,
        scene_number: u32,
        file_path: PathBuf,
        reason: String,
    ) -> Self {
        Self {
            kind,
            scene_number,
            file_path,
            status: AssetStatus::Placeholder,
            detail: Some(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AssetStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Audio,
    Image,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Audio => "audio",
            AssetKind::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Ok,
    Placeholder,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Completed,
    Error,
}

/// Orchestration state of one pipeline run. Mutated monotonically by the
/// orchestrator at stage boundaries, terminal on `Completed` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub moral_input: String,
    pub current_step: String,
    pub progress_percent: u8,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<PathBuf>,
    #[serde(default)]
    pub rendered_scenes: usize,
    #[serde(default)]
    pub degraded_scenes: usize,
}

impl PipelineRun {
    pub fn new(run_id: String, moral_input: String) -> Self {
        Self {
            run_id,
            moral_input,
            current_step: "Iniciando...".to_string(),
            progress_percent: 0,
            status: RunStatus::Processing,
            error_detail: None,
            video_path: None,
            rendered_scenes: 0,
            degraded_scenes: 0,
        }
    }
}

/// Shared run-progress table, injected into the orchestrator instead of
/// living in a process-wide global. Cheap to clone.
#[derive(Clone, Default)]
pub struct RunStore {
    inner: Arc<Mutex<HashMap<String, PipelineRun>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: PipelineRun) {
        self.inner
            .lock()
            .expect("run store poisoned")
            .insert(run.run_id.clone(), run);
    }

    pub fn get(&self, run_id: &str) -> Option<PipelineRun> {
        self.inner
            .lock()
            .expect("run store poisoned")
            .get(run_id)
            .cloned()
    }

    /// Applies `f` to the run and returns the updated snapshot.
    pub fn update<F>(&self, run_id: &str, f: F) -> Option<PipelineRun>
    where
        F: FnOnce(&mut PipelineRun),
    {
        let mut guard = self.inner.lock().expect("run store poisoned");
        let run = guard.get_mut(run_id)?;
        f(run);
        Some(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_store_updates_in_place() {
        let store = RunStore::new();
        store.insert(PipelineRun::new("abc123".to_string(), "ser honesto".to_string()));

        store.update("abc123", |run| {
            run.current_step = "Generando guion...".to_string();
            run.progress_percent = 20;
        });

        let run = store.get("abc123").unwrap();
        assert_eq!(run.progress_percent, 20);
        assert_eq!(run.status, RunStatus::Processing);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn asset_constructors_set_status() {
        let ok = Asset::ok(AssetKind::Image, 1, PathBuf::from("image_1.png"));
        assert!(ok.is_ok());
        let degraded = Asset::placeholder(
            AssetKind::Audio,
            2,
            PathBuf::from("dialogue_2.mp3"),
            "timeout".to_string(),
        );
        assert!(!degraded.is_ok());
        assert_eq!(degraded.detail.as_deref(), Some("timeout"));
    }
}
