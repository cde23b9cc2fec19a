use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::assembly::AssemblyConfig;
use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::speech::SpeechConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default = "default_assets")]
    pub assets_folder: String,

    #[serde(default)]
    pub unattended: bool,

    /// Per-request deadline for every external service call. A timeout takes
    /// that call's ordinary failure path, never a whole-run abort.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Optional viewer profile used to personalize stage-1 prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

/// Viewer preferences. Augments the narrative prompt but can never override
/// the moral or the fixed character roster.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserProfile {
    pub age: u8,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_assets() -> String {
    "assets".to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_level() -> String {
    "medio".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        fs::create_dir_all(&self.assets_folder)?;
        fs::create_dir_all(self.scenarios_dir())?;
        fs::create_dir_all(self.sounds_dir())?;
        Ok(())
    }

    pub fn scenarios_dir(&self) -> PathBuf {
        Path::new(&self.assets_folder).join("scenarios")
    }

    pub fn sounds_dir(&self) -> PathBuf {
        Path::new(&self.assets_folder).join("background_sounds")
    }

    pub fn characters_dir(&self) -> PathBuf {
        Path::new(&self.assets_folder).join("characters")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        Path::new(&self.build_folder).join(run_id)
    }
}
