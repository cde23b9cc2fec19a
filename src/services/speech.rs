use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::Config;

/// Text-to-speech client used by the voice stage. Returns encoded audio
/// bytes in the configured output format.
#[async_trait]
pub trait SpeechClient: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_speech_concurrency")]
    pub max_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevenlabs: Option<ElevenLabsConfig>,
    /// Character id (lowercase) to provider voice id.
    #[serde(default)]
    pub voices: HashMap<String, String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            max_concurrency: default_speech_concurrency(),
            elevenlabs: None,
            voices: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_provider() -> String {
    "elevenlabs".to_string()
}
fn default_speech_concurrency() -> usize {
    3
}
fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_output_format() -> String {
    "mp3_44100_128".to_string()
}

pub fn create_speech_client(config: &Config) -> Result<Box<dyn SpeechClient>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.speech.provider.as_str() {
        "elevenlabs" => {
            let cfg = config
                .speech
                .elevenlabs
                .as_ref()
                .context("ElevenLabs config missing")?;
            Ok(Box::new(ElevenLabsClient::new(
                &cfg.api_key,
                &cfg.model_id,
                &cfg.output_format,
                timeout,
            )?))
        }
        _ => Err(anyhow!(
            "Unknown speech provider: {}",
            config.speech.provider
        )),
    }
}

// --- ElevenLabs ---

struct ElevenLabsClient {
    api_key: String,
    model_id: String,
    output_format: String,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    fn new(api_key: &str, model_id: &str, output_format: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            output_format: output_format.to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[derive(Serialize)]
struct TtsRequest {
    text: String,
    model_id: String,
}

#[async_trait]
impl SpeechClient for ElevenLabsClient {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format={}",
            voice_id, self.output_format
        );

        let request_body = TtsRequest {
            text: text.to_string(),
            model_id: self.model_id.clone(),
        };

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("ElevenLabs API error: {}", error_text));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(anyhow!("ElevenLabs returned empty audio"));
        }
        Ok(bytes.to_vec())
    }
}
