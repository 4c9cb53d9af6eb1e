//! Read models and operation outcomes exposed by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::parse_timestamp;
use crate::db::progress_repo::ProgressRow;

/// Global queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_cancelled: u64,
    pub total_reaped: u64,
    /// Mean seconds between claim and completion.
    pub avg_processing_time: f64,
}

/// Progress counters for one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceProgress {
    pub space_id: String,
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rate_per_second: f64,
    /// `None` while no completions have been observed in the window.
    pub eta_seconds: Option<f64>,
    pub batch_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SpaceProgress {
    /// An all-zero record for a space the store has never seen.
    pub fn empty(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            total: 0,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            rate_per_second: 0.0,
            eta_seconds: None,
            batch_id: None,
            started_at: None,
            updated_at: None,
        }
    }

    /// Jobs that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub(crate) fn from_row(row: ProgressRow) -> Self {
        let clamp = |v: i64| u64::try_from(v).unwrap_or(0);
        Self {
            started_at: parse_timestamp(&row.started_at).ok(),
            updated_at: parse_timestamp(&row.updated_at).ok(),
            space_id: row.space_id,
            total: clamp(row.total),
            pending: clamp(row.pending),
            processing: clamp(row.processing),
            completed: clamp(row.completed),
            failed: clamp(row.failed),
            cancelled: clamp(row.cancelled),
            rate_per_second: row.rate_per_second,
            eta_seconds: row.eta_seconds,
            batch_id: row.batch_id,
        }
    }
}

/// What `fail` did with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Back in `pending`, claimable no earlier than `retry_at`.
    Retrying {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal: moved to `failed`.
    Failed,
    /// Cancellation had been requested; the job ended `cancelled` instead.
    Cancelled,
    /// The job was not in `processing`; nothing changed.
    NotProcessing,
}

/// What `cancel` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from `pending` before any worker claimed it.
    Cancelled,
    /// In flight; the owning worker will stop at its next checkpoint.
    Requested,
    /// Already completed, failed or cancelled.
    AlreadyFinished,
}

/// Result of submitting a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub space_id: String,
    pub job_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of cancelling every job in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCancellation {
    pub batch_id: String,
    pub cancelled: usize,
    pub requested: usize,
    pub already_finished: usize,
}
