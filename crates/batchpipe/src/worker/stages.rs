//! Pipeline stages a worker runs for one job: OCR, extraction, embedding.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{InferenceConfig, ModelsConfig};
use crate::error::StageError;
use crate::inference::{EmbedRequest, GenerateRequest, InferenceClient};
use crate::queue::{JobType, PipelineJob, DEFAULT_SCHEMA};

/// Characters of OCR text echoed back in a `full` result.
const FULL_TEXT_PREVIEW_CHARS: usize = 500;

pub const EMPTY_OCR_ERROR: &str = "OCR returned empty text";

#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub models: ModelsConfig,
    pub ocr_timeout: Duration,
    pub extract_timeout: Duration,
    pub embed_timeout: Duration,
    pub max_text_chars: usize,
    pub default_schema: String,
    pub ocr_prompt: String,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::from(&InferenceConfig::default())
    }
}

impl From<&InferenceConfig> for StageSettings {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            models: config.models.clone(),
            ocr_timeout: Duration::from_secs(config.timeouts.ocr_secs),
            extract_timeout: Duration::from_secs(config.timeouts.extract_secs),
            embed_timeout: Duration::from_secs(config.timeouts.embed_secs),
            max_text_chars: config.max_text_chars,
            default_schema: config.default_schema.clone(),
            ocr_prompt: config.ocr_prompt.clone(),
        }
    }
}

pub struct Stages {
    client: Arc<dyn InferenceClient>,
    settings: StageSettings,
}

impl Stages {
    pub fn new(client: Arc<dyn InferenceClient>, settings: StageSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Runs the stages `job.job_type` calls for and returns the job result.
    ///
    /// `is_cancelled` is polled before the first stage and between chained
    /// stages; a positive answer aborts with [`StageError::Cancelled`].
    pub async fn run<F>(
        &self,
        job: &PipelineJob,
        device: u32,
        is_cancelled: F,
    ) -> Result<Value, StageError>
    where
        F: Fn() -> bool + Send + Sync,
    {
        checkpoint(&is_cancelled)?;
        let input = &job.input_data;

        match job.job_type {
            JobType::Ocr => {
                let text = self.ocr(input, device).await?;
                Ok(json!({ "text": text, "gpu_id": device }))
            }
            JobType::Extract => {
                let text = required_text(input)?;
                self.extract(text, self.schema_of(input), device).await
            }
            JobType::Embed => {
                let text = required_text(input)?;
                let embedding = self.embed(text, device).await?;
                let dimensions = embedding.len();
                Ok(json!({ "embedding": embedding, "dimensions": dimensions }))
            }
            JobType::Full => {
                let text = self.ocr(input, device).await?;
                if text.is_empty() {
                    return Ok(json!({ "error": EMPTY_OCR_ERROR }));
                }

                checkpoint(&is_cancelled)?;
                let extracted = self.extract(&text, self.schema_of(input), device).await?;

                checkpoint(&is_cancelled)?;
                let embedding = self.embed(&text, device).await?;

                Ok(json!({
                    "text": truncate_chars(&text, FULL_TEXT_PREVIEW_CHARS),
                    "extracted": extracted,
                    "embedding_dims": embedding.len(),
                    "gpu_id": device,
                }))
            }
        }
    }

    /// Transcribes the job's document image.
    pub async fn ocr(&self, input: &Value, device: u32) -> Result<String, StageError> {
        let image = image_payload(input).await?;
        debug!(device, bytes = image.len(), "running OCR stage");
        let text = self
            .client
            .generate(GenerateRequest {
                model: self.settings.models.ocr.clone(),
                prompt: self.settings.ocr_prompt.clone(),
                images: vec![image],
                json: false,
                device: Some(device),
                timeout: self.settings.ocr_timeout,
            })
            .await?;
        Ok(text)
    }

    /// Structured extraction. A response that is not JSON is kept as `{"raw": ...}`.
    pub async fn extract(&self, text: &str, schema: &str, device: u32) -> Result<Value, StageError> {
        let prompt = format!(
            "Extract data from this text according to {}:\n\n{}\n\nReturn JSON with: product_name, features[], citations[]",
            schema,
            truncate_chars(text, self.settings.max_text_chars)
        );
        debug!(device, schema, "running extract stage");
        let response = self
            .client
            .generate(GenerateRequest {
                model: self.settings.models.extract.clone(),
                prompt,
                images: Vec::new(),
                json: true,
                device: Some(device),
                timeout: self.settings.extract_timeout,
            })
            .await?;

        Ok(serde_json::from_str(&response).unwrap_or_else(|e| {
            debug!("extract response is not JSON ({}), keeping raw text", e);
            json!({ "raw": response })
        }))
    }

    pub async fn embed(&self, text: &str, device: u32) -> Result<Vec<f32>, StageError> {
        debug!(device, "running embed stage");
        let embedding = self
            .client
            .embed(EmbedRequest {
                model: self.settings.models.embed.clone(),
                text: truncate_chars(text, self.settings.max_text_chars).to_string(),
                device: Some(device),
                timeout: self.settings.embed_timeout,
            })
            .await?;
        Ok(embedding)
    }

    fn schema_of<'a>(&'a self, input: &'a Value) -> &'a str {
        input
            .get("schema")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(if self.settings.default_schema.is_empty() {
                DEFAULT_SCHEMA
            } else {
                self.settings.default_schema.as_str()
            })
    }
}

fn checkpoint<F: Fn() -> bool>(is_cancelled: &F) -> Result<(), StageError> {
    if is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}

fn required_text(input: &Value) -> Result<&str, StageError> {
    input
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::Input("input_data.text is missing".to_string()))
}

/// The base64 image for OCR: inline `base64`, else the file at `file_path`.
async fn image_payload(input: &Value) -> Result<String, StageError> {
    if let Some(encoded) = input.get("base64").and_then(Value::as_str) {
        return Ok(encoded.to_string());
    }

    let path = input
        .get("file_path")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StageError::Input("input_data needs either base64 or file_path".to_string())
        })?;

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StageError::Input(format!("cannot read '{}': {}", path, e)))?;
    Ok(STANDARD.encode(bytes))
}

/// The first `max` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
