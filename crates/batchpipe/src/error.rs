use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Inference error: {0}")]
    Inference(#[from] crate::inference::InferenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::accelerator::TelemetryError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log level '{level}': {source}")]
    InvalidFilter {
        level: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to bridge log records: {0}")]
    Bridge(#[from] log::SetLoggerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No job store path configured and no home directory found")]
    NoDatabasePath,

    #[error("Worker task failed: {0}")]
    Join(String),
}

/// Errors raised while running one pipeline stage for a job.
#[derive(Error, Debug)]
pub enum StageError {
    /// The job's payload cannot be processed; retrying will not help.
    #[error("Invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Inference(#[from] crate::inference::InferenceError),

    /// Cancellation was requested and observed at a checkpoint.
    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Inference(_))
    }
}

pub type Result<T> = std::result::Result<T, BatchpipeError>;
