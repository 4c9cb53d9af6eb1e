//! Ordering and backoff arithmetic for the pending set.
//!
//! All values are integer microseconds since the Unix epoch.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::job::MAX_PRIORITY;

/// Weight of one priority step (10^10 seconds). One step outweighs any
/// difference in creation time.
pub const PRIORITY_WEIGHT: i64 = 10_000_000_000_000_000;

/// Clamps a priority into `0..=MAX_PRIORITY`.
pub fn clamp_priority(priority: i64) -> i64 {
    priority.clamp(0, MAX_PRIORITY)
}

/// Score of a pending entry: lower pops first.
pub fn pending_score(priority: i64, ready_at_micros: i64) -> i64 {
    (MAX_PRIORITY - clamp_priority(priority)) * PRIORITY_WEIGHT + ready_at_micros
}

/// Delay before retry attempt `attempts + 1`: `base * 2^attempts`, capped.
pub fn backoff(base: Duration, attempts: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

pub fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn duration_micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}
