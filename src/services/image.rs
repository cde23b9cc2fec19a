use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Config;

/// Image-generation client shared by the scenario library and the
/// illustration stage.
///
/// `references` are PNG bytes attached to the prompt so the model can copy
/// exact character and background appearances. An Err from `generate`
/// covers both transport failures and responses with no image payload.
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, prompt: &str, references: &[Vec<u8>]) -> Result<Vec<u8>>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_image_concurrency")]
    pub max_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<GeminiImageConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            max_concurrency: default_image_concurrency(),
            gemini: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiImageConfig {
    pub api_key: String,
    pub model: String,
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_image_concurrency() -> usize {
    2
}

pub fn create_image_client(config: &Config) -> Result<Arc<dyn ImageClient>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.image.provider.as_str() {
        "gemini" => {
            let cfg = config
                .image
                .gemini
                .as_ref()
                .context("Gemini image config missing")?;
            Ok(Arc::new(GeminiImageClient::new(
                &cfg.api_key,
                &cfg.model,
                timeout,
            )?))
        }
        _ => Err(anyhow!("Unknown image provider: {}", config.image.provider)),
    }
}

// --- Gemini ---

struct GeminiImageClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiImageClient {
    fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum GeminiPart {
    Text(String),
    InlineData(GeminiBlob),
}

#[derive(Serialize)]
struct GeminiBlob {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiBlobResponse>,
}

#[derive(Deserialize)]
struct GeminiBlobResponse {
    data: String,
}

#[derive(Deserialize)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(&self, prompt: &str, references: &[Vec<u8>]) -> Result<Vec<u8>> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let engine = base64::engine::general_purpose::STANDARD;
        let mut parts = vec![GeminiPart::Text(prompt.to_string())];
        for reference in references {
            parts.push(GeminiPart::InlineData(GeminiBlob {
                mime_type: "image/png".to_string(),
                data: engine.encode(reference),
            }));
        }

        let request_body = GeminiRequest {
            contents: vec![GeminiContent { parts }],
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let result: GeminiResponse = resp.json().await?;
        if let Some(err) = result.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        // The model interleaves text and image parts; the first inline blob
        // is the generated image.
        for candidate in &result.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(blob) = &part.inline_data {
                        return Ok(engine.decode(&blob.data)?);
                    }
                }
            }
        }

        Err(anyhow!("Gemini response contained no image payload"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_data_part_uses_camel_case() {
        let part = GeminiPart::InlineData(GeminiBlob {
            mime_type: "image/png".to_string(),
            data: "QUJD".to_string(),
        });
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn response_without_image_part_is_detected() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"sorry"}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(json).unwrap();
        let has_image = parsed.candidates.iter().any(|c| {
            c.content
                .as_ref()
                .is_some_and(|content| content.parts.iter().any(|p| p.inline_data.is_some()))
        });
        assert!(!has_image);
    }

    #[test]
    fn response_with_image_part_decodes() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"here"},{"inlineData":{"mimeType":"image/png","data":"QUJD"}}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(json).unwrap();
        let blob = parsed.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .find_map(|p| p.inline_data.as_ref())
            .unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&blob.data)
            .unwrap();
        assert_eq!(bytes, b"ABC");
    }
}
