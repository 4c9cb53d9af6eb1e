//! Named global counters shared by every process using the store.

use std::collections::HashMap;

use rusqlite::{params, Connection};

use super::DatabaseError;

pub const TOTAL_ENQUEUED: &str = "total_enqueued";
pub const TOTAL_COMPLETED: &str = "total_completed";
pub const TOTAL_FAILED: &str = "total_failed";
pub const TOTAL_RETRIES: &str = "total_retries";
pub const TOTAL_CANCELLED: &str = "total_cancelled";
pub const TOTAL_REAPED: &str = "total_reaped";
/// Cumulative seconds spent processing completed jobs.
pub const TOTAL_PROCESSING_TIME: &str = "total_processing_time";

/// Adds `delta` to a counter, creating it at zero first if needed.
pub fn incr(conn: &Connection, name: &str, delta: f64) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO queue_counters (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
        params![name, delta],
    )?;
    Ok(())
}

/// Reads every counter. Counters never incremented are absent.
pub fn get_all(conn: &Connection) -> Result<HashMap<String, f64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT name, value FROM queue_counters")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}
