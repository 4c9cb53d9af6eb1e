//! Boundary to the external model service (OCR, extraction, embeddings).

pub mod error;
pub mod ollama;

use std::time::Duration;

use async_trait::async_trait;

pub use error::InferenceError;
pub use ollama::OllamaClient;

/// A text (optionally image-conditioned) generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// Base64-encoded images.
    pub images: Vec<String>,
    /// Ask the service to constrain output to JSON.
    pub json: bool,
    /// Device hint from the orchestrator.
    pub device: Option<u32>,
    pub timeout: Duration,
}

/// An embedding call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedRequest {
    pub model: String,
    pub text: String,
    pub device: Option<u32>,
    pub timeout: Duration,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError>;

    async fn embed(&self, request: EmbedRequest) -> Result<Vec<f32>, InferenceError>;
}
