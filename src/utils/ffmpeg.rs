//! FFmpeg command builder and runner.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::core::error::PipelineError;

/// Builder for multi-input FFmpeg invocations.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<Input>,
    output: PathBuf,
    output_args: Vec<String>,
    log_level: String,
}

#[derive(Debug, Clone)]
struct Input {
    path: PathBuf,
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    /// Add an input with per-input arguments placed before its `-i`.
    pub fn input<I, S>(mut self, path: impl AsRef<Path>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push(Input {
            path: path.as_ref().to_path_buf(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn filter_complex(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{seconds:.3}"))
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
        ];
        for input in &self.inputs {
            args.extend(input.args.clone());
            args.push("-i".to_string());
            args.push(input.path.to_string_lossy().to_string());
        }
        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs FFmpeg commands with a hard per-invocation timeout.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    timeout: Duration,
}

impl FfmpegRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> Result<()> {
        let args = cmd.build_args();
        debug!("ffmpeg {}", args.join(" "));

        let child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("ffmpeg timed out after {} seconds", self.timeout.as_secs());
                return Err(anyhow!(
                    "ffmpeg timed out after {} seconds",
                    self.timeout.as_secs()
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(())
    }
}

pub fn check_ffmpeg() -> Result<(), PipelineError> {
    which::which("ffmpeg").map_err(|_| PipelineError::FfmpegNotFound)?;
    Ok(())
}

pub fn check_ffprobe() -> Result<(), PipelineError> {
    which::which("ffprobe").map_err(|_| PipelineError::FfprobeNotFound)?;
    Ok(())
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Returns the media duration in seconds via ffprobe.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "ffprobe failed on {}: {}",
            path.display(),
            stderr.trim()
        ));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .ok_or_else(|| anyhow!("ffprobe reported no duration for {}", path.display()))?;
    Ok(duration.parse::<f64>()?)
}
