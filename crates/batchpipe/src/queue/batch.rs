//! Batch synthesis: one job per file.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::job::{priority, JobType, PipelineJob};

pub const DEFAULT_SCHEMA: &str = "ETIM-9.0";

/// A request to process many files the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub space_id: String,
    /// File paths (or inline payloads) in submission order.
    pub files: Vec<String>,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_job_type() -> JobType {
    JobType::Full
}

fn default_priority() -> i64 {
    priority::NORMAL
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl BatchRequest {
    pub fn new(space_id: impl Into<String>, files: Vec<String>, job_type: JobType) -> Self {
        Self {
            space_id: space_id.into(),
            files,
            job_type,
            priority: default_priority(),
            schema: default_schema(),
            options: Map::new(),
        }
    }

    /// Builds the jobs for this batch with ids `"{batch_id}-{n}"`.
    pub fn into_jobs(&self, batch_id: &str, max_attempts: u32) -> Vec<PipelineJob> {
        self.files
            .iter()
            .enumerate()
            .map(|(n, file)| {
                let input = json!({
                    "file_path": file,
                    "schema": self.schema,
                    "options": self.options,
                });
                PipelineJob::new(self.space_id.clone(), self.job_type, input)
                    .with_id(format!("{}-{}", batch_id, n))
                    .with_priority(self.priority)
                    .with_max_attempts(max_attempts)
            })
            .collect()
    }
}
