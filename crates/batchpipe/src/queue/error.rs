use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Corrupt record for job '{id}': {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

