use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat};
use pdf2image::{PDF, Pages};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::ExtractionError;

const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const OCR_MAX_TOKENS: u32 = 4000;

const OCR_PROMPT: &str = "You are an expert medical document OCR system. Extract ALL text from the attached \
    lab report page(s) exactly as written, preserving test names, values, units and reference ranges. \
    For multi-page input, start each page with '=== Page X ==='. \
    Return ONLY the extracted text without any commentary or explanations.";

/// OCR through a vision-capable chat model on OpenRouter
pub struct VisionOcr {
    client: Client,
    api_key: String,
    model: String,
}

impl VisionOcr {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::Ocr(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// OCR a single image file
    pub async fn ocr_image_file(
        &self,
        path: &Path,
        format: ImageFormat,
    ) -> Result<String, ExtractionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ExtractionError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let image = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| ExtractionError::Image(e.to_string()))?;

        self.extract_text(&[image]).await
    }

    /// Rasterise every page of a scanned PDF and OCR them in one call
    pub async fn ocr_pdf(&self, path: &Path) -> Result<String, ExtractionError> {
        let images = convert_pdf_to_images(path).await?;
        if images.is_empty() {
            return Err(ExtractionError::Pdf("no pages rendered from PDF".to_string()));
        }
        self.extract_text(&images).await
    }

    async fn extract_text(&self, images: &[DynamicImage]) -> Result<String, ExtractionError> {
        info!(pages = images.len(), model = %self.model, "Running vision OCR");

        let mut content = vec![json!({ "type": "text", "text": OCR_PROMPT })];
        for image in images {
            let encoded = image_to_base64(image)?;
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", encoded) }
            }));
        }

        let text = self.call_openrouter(content).await?;
        info!(characters = text.len(), "Vision OCR completed");
        Ok(text)
    }

    async fn call_openrouter(&self, content: Vec<Value>) -> Result<String, ExtractionError> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": OCR_MAX_TOKENS,
        });

        let response = self
            .client
            .post(OPENROUTER_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExtractionError::Ocr(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExtractionError::Ocr(format!(
                "OCR request failed: {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExtractionError::Ocr(e.to_string()))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExtractionError::Ocr("invalid response format from OCR model".to_string()))
    }
}

async fn convert_pdf_to_images(path: &Path) -> Result<Vec<DynamicImage>, ExtractionError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let pdf = PDF::from_file(&path).map_err(|e| ExtractionError::Pdf(e.to_string()))?;
        let pages = pdf
            .render(Pages::All, None)
            .map_err(|e| ExtractionError::Pdf(format!("failed to render pages: {e}")))?;
        info!(pages = pages.len(), "Rendered PDF pages for OCR");
        Ok(pages)
    })
    .await
    .map_err(|e| ExtractionError::Pdf(format!("PDF renderer aborted: {e}")))?
}

fn image_to_base64(image: &DynamicImage) -> Result<String, ExtractionError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| ExtractionError::Image(e.to_string()))?;
    Ok(STANDARD.encode(&buffer))
}
