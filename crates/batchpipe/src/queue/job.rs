//! The pipeline job model and its mapping to store rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::QueueError;
use crate::db::job_repo::JobRow;

pub const MAX_PRIORITY: i64 = 100;

/// Named priority levels. Any integer in `0..=MAX_PRIORITY` is accepted.
pub mod priority {
    pub const LOW: i64 = 1;
    pub const NORMAL: i64 = 5;
    pub const HIGH: i64 = 10;
    pub const CRITICAL: i64 = super::MAX_PRIORITY;
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Which pipeline stage (or chain of stages) a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Ocr,
    Extract,
    Embed,
    Full,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ocr => "ocr",
            JobType::Extract => "extract",
            JobType::Embed => "embed",
            JobType::Full => "full",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ocr" => Ok(JobType::Ocr),
            "extract" => Ok(JobType::Extract),
            "embed" => Ok(JobType::Embed),
            "full" => Ok(JobType::Full),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// The queue set a job with this status lives in. Cancelled jobs leave
    /// the sets entirely.
    pub fn queue_set(&self) -> Option<QueueSet> {
        match self {
            JobStatus::Pending | JobStatus::Retrying => Some(QueueSet::Pending),
            JobStatus::Processing => Some(QueueSet::Processing),
            JobStatus::Completed => Some(QueueSet::Completed),
            JobStatus::Failed => Some(QueueSet::Failed),
            JobStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// One of the four disjoint id collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueSet {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueSet::Pending => "pending",
            QueueSet::Processing => "processing",
            QueueSet::Completed => "completed",
            QueueSet::Failed => "failed",
        }
    }
}

impl FromStr for QueueSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueSet::Pending),
            "processing" => Ok(QueueSet::Processing),
            "completed" => Ok(QueueSet::Completed),
            "failed" => Ok(QueueSet::Failed),
            other => Err(format!("unknown queue set '{}'", other)),
        }
    }
}

/// One unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: String,
    pub space_id: String,
    pub job_type: JobType,
    /// Opaque payload: file reference, target schema, options.
    pub input_data: Value,
    /// Higher is more urgent.
    pub priority: i64,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_data: Option<Value>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl PipelineJob {
    /// Creates a pending job with a fresh v4 id and normal priority.
    pub fn new(space_id: impl Into<String>, job_type: JobType, input_data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            space_id: space_id.into(),
            job_type,
            input_data,
            priority: priority::NORMAL,
            status: JobStatus::Pending,
            worker_id: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            output_data: None,
            cancel_requested: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Wall-clock time between claim and completion, if both are known.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub(crate) fn to_row(&self) -> Result<JobRow, QueueError> {
        Ok(JobRow {
            id: self.id.clone(),
            space_id: self.space_id.clone(),
            job_type: self.job_type.as_str().to_string(),
            input_data: serde_json::to_string(&self.input_data)?,
            priority: self.priority,
            status: self.status.as_str().to_string(),
            worker_id: self.worker_id.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: format_timestamp(self.created_at),
            started_at: self.started_at.map(format_timestamp),
            completed_at: self.completed_at.map(format_timestamp),
            error_message: self.error_message.clone(),
            output_data: self
                .output_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            cancel_requested: self.cancel_requested,
            updated_at: format_timestamp(now()),
        })
    }

    pub(crate) fn from_row(row: JobRow) -> Result<Self, QueueError> {
        let corrupt = |reason: String| QueueError::CorruptRecord {
            id: row.id.clone(),
            reason,
        };

        let job_type = row.job_type.parse::<JobType>().map_err(&corrupt)?;
        let status = row.status.parse::<JobStatus>().map_err(&corrupt)?;
        let input_data = serde_json::from_str(&row.input_data)
            .map_err(|e| corrupt(format!("input_data: {}", e)))?;
        let output_data = row
            .output_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("output_data: {}", e)))?;
        let created_at = parse_timestamp(&row.created_at).map_err(&corrupt)?;
        let started_at = row
            .started_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(&corrupt)?;
        let completed_at = row
            .completed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(&corrupt)?;

        Ok(Self {
            id: row.id,
            space_id: row.space_id,
            job_type,
            input_data,
            priority: row.priority,
            status,
            worker_id: row.worker_id,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at,
            started_at,
            completed_at,
            error_message: row.error_message,
            output_data,
            cancel_requested: row.cancel_requested,
        })
    }
}

/// Current time at the microsecond precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}
