//! Row-level operations for the `jobs` table.
//!
//! Functions take a `&Connection` so the queue can compose several of them
//! inside one transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub space_id: String,
    pub job_type: String,
    pub input_data: String,
    pub priority: i64,
    pub status: String,
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub output_data: Option<String>,
    pub cancel_requested: bool,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            space_id: row.get("space_id")?,
            job_type: row.get("job_type")?,
            input_data: row.get("input_data")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            worker_id: row.get("worker_id")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            output_data: row.get("output_data")?,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, space_id, job_type, input_data, priority, status, worker_id,
         attempts, max_attempts, created_at, started_at, completed_at, error_message,
         output_data, cancel_requested, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.id,
            job.space_id,
            job.job_type,
            job.input_data,
            job.priority,
            job.status,
            job.worker_id,
            job.attempts,
            job.max_attempts,
            job.created_at,
            job.started_at,
            job.completed_at,
            job.error_message,
            job.output_data,
            job.cancel_requested as i64,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Updates an existing job row. All fields except `id`, `space_id` and
/// `created_at` are overwritten.
pub fn update(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET job_type=?2, input_data=?3, priority=?4, status=?5, worker_id=?6,
         attempts=?7, max_attempts=?8, started_at=?9, completed_at=?10, error_message=?11,
         output_data=?12, cancel_requested=?13, updated_at=?14
         WHERE id=?1",
        params![
            job.id,
            job.job_type,
            job.input_data,
            job.priority,
            job.status,
            job.worker_id,
            job.attempts,
            job.max_attempts,
            job.started_at,
            job.completed_at,
            job.error_message,
            job.output_data,
            job.cancel_requested as i64,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns the ids of all jobs whose id starts with `prefix`.
pub fn ids_with_prefix(conn: &Connection, prefix: &str) -> Result<Vec<String>, DatabaseError> {
    // `instr` avoids LIKE wildcard escaping for ids containing '%' or '_'.
    let mut stmt = conn.prepare("SELECT id FROM jobs WHERE instr(id, ?1) = 1 ORDER BY id")?;
    let ids = stmt
        .query_map(params![prefix], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Sets the cooperative cancellation flag on a job.
pub fn set_cancel_requested(
    conn: &Connection,
    id: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
        params![id, updated_at],
    )?;
    Ok(changed == 1)
}

/// Reads only the cancellation flag; `None` when the job does not exist.
pub fn cancel_requested(conn: &Connection, id: &str) -> Result<Option<bool>, DatabaseError> {
    let flag = conn
        .query_row(
            "SELECT cancel_requested FROM jobs WHERE id = ?1",
            params![id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(flag.map(|v| v != 0))
}
