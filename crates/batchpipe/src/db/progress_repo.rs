//! Per-space progress records.
//!
//! Counter deltas are applied with a single UPSERT so the queue can fold
//! them into the same transaction as the state transition they describe.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw `space_progress` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRow {
    pub space_id: String,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub rate_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub batch_id: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

impl ProgressRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            space_id: row.get("space_id")?,
            total: row.get("total")?,
            pending: row.get("pending")?,
            processing: row.get("processing")?,
            completed: row.get("completed")?,
            failed: row.get("failed")?,
            cancelled: row.get("cancelled")?,
            rate_per_second: row.get("rate_per_second")?,
            eta_seconds: row.get("eta_seconds")?,
            batch_id: row.get("batch_id")?,
            started_at: row.get("started_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Signed changes to a space's counters for one transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl ProgressDelta {
    pub fn enqueued(n: i64) -> Self {
        Self {
            total: n,
            pending: n,
            ..Self::default()
        }
    }

    pub fn claimed() -> Self {
        Self {
            pending: -1,
            processing: 1,
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            processing: -1,
            completed: 1,
            ..Self::default()
        }
    }

    pub fn retried() -> Self {
        Self {
            processing: -1,
            pending: 1,
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            processing: -1,
            failed: 1,
            ..Self::default()
        }
    }

    pub fn cancelled_from_pending() -> Self {
        Self {
            pending: -1,
            cancelled: 1,
            ..Self::default()
        }
    }

    pub fn cancelled_from_processing() -> Self {
        Self {
            processing: -1,
            cancelled: 1,
            ..Self::default()
        }
    }
}

/// Applies `delta` to the space record, creating the record if missing.
pub fn adjust(
    conn: &Connection,
    space_id: &str,
    delta: ProgressDelta,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO space_progress
            (space_id, total, pending, processing, completed, failed, cancelled,
             started_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(space_id) DO UPDATE SET
            total = total + excluded.total,
            pending = pending + excluded.pending,
            processing = processing + excluded.processing,
            completed = completed + excluded.completed,
            failed = failed + excluded.failed,
            cancelled = cancelled + excluded.cancelled,
            updated_at = excluded.updated_at",
        params![
            space_id,
            delta.total,
            delta.pending,
            delta.processing,
            delta.completed,
            delta.failed,
            delta.cancelled,
            now,
        ],
    )?;
    Ok(())
}

/// Stores the derived rate and ETA. Returns false if the space is unknown.
pub fn set_rate(
    conn: &Connection,
    space_id: &str,
    rate_per_second: f64,
    eta_seconds: Option<f64>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE space_progress SET rate_per_second = ?2, eta_seconds = ?3, updated_at = ?4
         WHERE space_id = ?1",
        params![space_id, rate_per_second, eta_seconds, now],
    )?;
    Ok(changed == 1)
}

/// Records which batch most recently fed the space, and when it started.
pub fn set_batch(
    conn: &Connection,
    space_id: &str,
    batch_id: &str,
    started_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE space_progress SET batch_id = ?2, started_at = ?3, updated_at = ?3
         WHERE space_id = ?1",
        params![space_id, batch_id, started_at],
    )?;
    Ok(())
}

pub fn find(conn: &Connection, space_id: &str) -> Result<Option<ProgressRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM space_progress WHERE space_id = ?1",
            params![space_id],
            ProgressRow::from_row,
        )
        .optional()?;
    Ok(row)
}
