//! Ollama HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EmbedRequest, GenerateRequest, InferenceClient, InferenceError};
use crate::config::InferenceConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest error body kept in an `InferenceError::Status`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: GpuOptions,
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Serialize)]
struct GpuOptions {
    num_gpu: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    main_gpu: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Talks to `/api/generate` and `/api/embeddings` of an Ollama server.
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self, InferenceError> {
        Self::new(config.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the server answers `/api/tags`.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("Inference health check failed: {}", e);
                false
            }
        }
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<String, InferenceError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    endpoint: endpoint.to_string(),
                    secs: timeout.as_secs(),
                }
            } else {
                InferenceError::Transport(e.to_string())
            }
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let text = response.text().await.map_err(classify)?;
        if !status.is_success() {
            return Err(InferenceError::Status {
                code: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            images: &request.images,
            stream: false,
            format: request.json.then_some("json"),
            options: GpuOptions {
                num_gpu: 1,
                main_gpu: request.device,
            },
        };
        let text = self
            .post_json("/api/generate", &body, request.timeout)
            .await?;
        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Malformed(format!("generate: {}", e)))?;
        Ok(parsed.response)
    }

    async fn embed(&self, request: EmbedRequest) -> Result<Vec<f32>, InferenceError> {
        let body = EmbedBody {
            model: &request.model,
            prompt: &request.text,
        };
        let text = self
            .post_json("/api/embeddings", &body, request.timeout)
            .await?;
        let parsed: EmbedResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Malformed(format!("embeddings: {}", e)))?;
        if parsed.embedding.is_empty() {
            return Err(InferenceError::Malformed(
                "embeddings: empty vector".to_string(),
            ));
        }
        Ok(parsed.embedding)
    }
}
