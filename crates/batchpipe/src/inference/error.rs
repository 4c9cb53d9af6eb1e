use thiserror::Error;

/// Failures talking to the inference service. All of them are transient
/// from the queue's point of view.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Request to {endpoint} timed out after {secs}s")]
    Timeout { endpoint: String, secs: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Inference service returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Malformed inference response: {0}")]
    Malformed(String),
}
