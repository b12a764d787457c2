//! Mistral OCR backend (uses Mistral's OCR API).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::TextRecognizer;

pub struct MistralRecognizer {
    api_key: String,
    client: reqwest::Client,
}

impl MistralRecognizer {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { api_key, client }
    }
}

// ── Mistral API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct OcrRequest {
    model: String,
    document: DocumentSource,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DocumentSource {
    #[serde(rename = "image_url")]
    Image { image_url: String },
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<MistralPage>,
}

#[derive(Deserialize)]
struct MistralPage {
    markdown: String,
}

// ── Backend implementation ──────────────────────────────────────────────────

#[async_trait::async_trait]
impl TextRecognizer for MistralRecognizer {
    async fn recognize(&self, image: &[u8]) -> anyhow::Result<Vec<String>> {
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(image));
        let body = OcrRequest {
            model: "mistral-ocr-latest".to_string(),
            document: DocumentSource::Image { image_url: data_url },
        };

        info!("MistralRecognizer: calling OCR API ({} byte scan)", image.len());

        let resp = self
            .client
            .post("https://api.mistral.ai/v1/ocr")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Mistral OCR API error ({}): {}", status, text);
        }

        let ocr: OcrResponse = resp.json().await?;
        let lines: Vec<String> = ocr
            .pages
            .iter()
            .flat_map(|p| p.markdown.lines())
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        debug!("MistralRecognizer: {} lines recognized", lines.len());
        Ok(lines)
    }
}
