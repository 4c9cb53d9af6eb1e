//! Builders for test jobs and devices.

#![allow(dead_code)]

use serde_json::{json, Value};

use batchpipe::queue::{priority, JobType, PipelineJob};
use batchpipe::DeviceInfo;

/// Builder for `PipelineJob` instances.
pub struct JobBuilder {
    space_id: String,
    job_type: JobType,
    input: Value,
    priority: i64,
    max_attempts: u32,
    id: Option<String>,
}

impl JobBuilder {
    pub fn embed(text: &str) -> Self {
        Self::new(JobType::Embed, json!({ "text": text }))
    }

    pub fn ocr(base64: &str) -> Self {
        Self::new(JobType::Ocr, json!({ "base64": base64 }))
    }

    pub fn full(base64: &str) -> Self {
        Self::new(JobType::Full, json!({ "base64": base64 }))
    }

    pub fn new(job_type: JobType, input: Value) -> Self {
        Self {
            space_id: "space-1".to_string(),
            job_type,
            input,
            priority: priority::NORMAL,
            max_attempts: 3,
            id: None,
        }
    }

    pub fn space(mut self, space_id: &str) -> Self {
        self.space_id = space_id.to_string();
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn build(self) -> PipelineJob {
        let job = PipelineJob::new(self.space_id, self.job_type, self.input)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts);
        match self.id {
            Some(id) => job.with_id(id),
            None => job,
        }
    }
}

/// A device with `free_gb` GiB free out of 80 GiB at `utilization` percent.
pub fn device(index: u32, utilization: u32, free_gb: u64) -> DeviceInfo {
    device_with_total(index, utilization, free_gb, 80)
}

/// A device with `free_gb` GiB free out of `total_gb` GiB.
pub fn device_with_total(index: u32, utilization: u32, free_gb: u64, total_gb: u64) -> DeviceInfo {
    let total = total_gb * 1024;
    let free = free_gb * 1024;
    DeviceInfo {
        index,
        name: format!("GPU {}", index),
        memory_total: total,
        memory_used: total - free,
        memory_free: free,
        utilization,
        temperature: 50,
    }
}
