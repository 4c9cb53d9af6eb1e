//! The ordered `queue_entries` collection backing the four queue sets.
//!
//! Each live job id has exactly one entry naming the set it belongs to.
//! Scores and timestamps are integer microseconds since the Unix epoch.

use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseError;

/// Inserts a new entry. Fails if the id already has one.
pub fn insert(
    conn: &Connection,
    job_id: &str,
    queue: &str,
    score: i64,
    not_before: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO queue_entries (job_id, queue, score, not_before) VALUES (?1, ?2, ?3, ?4)",
        params![job_id, queue, score, not_before],
    )?;
    Ok(())
}

/// Returns the id of the lowest-scored pending entry that is ready at `now`.
pub fn peek_ready(conn: &Connection, now: i64) -> Result<Option<String>, DatabaseError> {
    let id = conn
        .query_row(
            "SELECT job_id FROM queue_entries
             WHERE queue = 'pending' AND not_before <= ?1
             ORDER BY score ASC, rowid ASC
             LIMIT 1",
            params![now],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

/// Moves an entry from `from` to `to`, rescoring it.
///
/// Returns false (and changes nothing) when the entry is not currently in `from`.
pub fn transfer(
    conn: &Connection,
    job_id: &str,
    from: &str,
    to: &str,
    score: i64,
    not_before: i64,
    lease_expires_at: Option<i64>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_entries
         SET queue = ?3, score = ?4, not_before = ?5, lease_expires_at = ?6
         WHERE job_id = ?1 AND queue = ?2",
        params![job_id, from, to, score, not_before, lease_expires_at],
    )?;
    Ok(changed == 1)
}

/// Removes an entry if it is currently in `from`.
pub fn remove_from(conn: &Connection, job_id: &str, from: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM queue_entries WHERE job_id = ?1 AND queue = ?2",
        params![job_id, from],
    )?;
    Ok(changed == 1)
}

/// Returns the set an id currently belongs to.
pub fn membership(conn: &Connection, job_id: &str) -> Result<Option<String>, DatabaseError> {
    let queue = conn
        .query_row(
            "SELECT queue FROM queue_entries WHERE job_id = ?1",
            params![job_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(queue)
}

/// Counts the entries in one set.
pub fn count(conn: &Connection, queue: &str) -> Result<u64, DatabaseError> {
    let n: u64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1",
        params![queue],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// Extends the lease of every processing entry owned by `worker_id`.
pub fn renew_leases(
    conn: &Connection,
    worker_id: &str,
    expires_at: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_entries SET lease_expires_at = ?2
         WHERE queue = 'processing'
           AND job_id IN (SELECT id FROM jobs WHERE worker_id = ?1)",
        params![worker_id, expires_at],
    )?;
    Ok(changed)
}

/// Returns processing entries whose lease ended before `now`.
pub fn expired_leases(conn: &Connection, now: i64) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT job_id FROM queue_entries
         WHERE queue = 'processing'
           AND lease_expires_at IS NOT NULL
           AND lease_expires_at < ?1
         ORDER BY lease_expires_at ASC",
    )?;
    let ids = stmt
        .query_map(params![now], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
