//! Shared priority job queue.
//!
//! Four disjoint id sets (`pending`, `processing`, `completed`, `failed`)
//! live in the `queue_entries` table of the job store. Every transition
//! runs in one IMMEDIATE transaction that moves the entry, rewrites the
//! job record, bumps the global counters and adjusts the space's progress
//! record together, so several processes can share one store file.

pub mod batch;
pub mod error;
pub mod job;
pub mod score;
pub mod stats;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::db::counters;
use crate::db::job_repo;
use crate::db::progress_repo::{self, ProgressDelta};
use crate::db::queue_repo;
use crate::db::Database;

pub use batch::{BatchRequest, DEFAULT_SCHEMA};
pub use error::QueueError;
pub use job::{priority, JobStatus, JobType, PipelineJob, QueueSet, MAX_PRIORITY};
pub use stats::{
    BatchCancellation, BatchReceipt, CancelOutcome, FailOutcome, QueueStats, SpaceProgress,
};

use job::{format_timestamp, now};
use score::{duration_micros, micros};

const PENDING: &str = "pending";
const PROCESSING: &str = "processing";
const COMPLETED: &str = "completed";
const FAILED: &str = "failed";

/// Retry and lease policy for a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Attempts given to jobs synthesized by `submit_batch`.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub lease_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: job::DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&crate::config::QueueConfig> for QueueSettings {
    fn from(config: &crate::config::QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
        }
    }
}

/// Handle to the shared queue. Cloning is cheap.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(db: Database, settings: QueueSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Stores the job and makes it claimable. Returns its id.
    pub fn enqueue(&self, job: PipelineJob) -> Result<String, QueueError> {
        let id = job.id.clone();
        self.db.with_tx(|tx| insert_pending(tx, vec![job]))?;
        Ok(id)
    }

    /// Enqueues many jobs in one transaction: either all are stored or none.
    pub fn enqueue_batch(&self, jobs: Vec<PipelineJob>) -> Result<Vec<String>, QueueError> {
        self.db.with_tx(|tx| insert_pending(tx, jobs))
    }

    /// Synthesizes one job per file and enqueues them as one batch.
    pub fn submit_batch(&self, request: &BatchRequest) -> Result<BatchReceipt, QueueError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let jobs = request.into_jobs(&batch_id, self.settings.max_attempts);
        let created_at = now();
        let ts = format_timestamp(created_at);

        let job_ids = self.db.with_tx(|tx| {
            let ids = insert_pending(tx, jobs)?;
            progress_repo::set_batch(tx, &request.space_id, &batch_id, &ts)?;
            Ok::<_, QueueError>(ids)
        })?;

        log::info!(
            "Batch {}: {} jobs enqueued for space {}",
            batch_id,
            job_ids.len(),
            request.space_id
        );

        Ok(BatchReceipt {
            batch_id,
            space_id: request.space_id.clone(),
            job_ids,
            created_at,
        })
    }

    /// Claims up to `count` ready jobs for `worker_id`, best first.
    ///
    /// Each claimed job is in `processing` with `attempts` incremented and a
    /// fresh lease. Returns fewer jobs (possibly none) when `pending` holds
    /// no more ready work.
    pub fn dequeue(&self, worker_id: &str, count: usize) -> Result<Vec<PipelineJob>, QueueError> {
        let span = tracing::debug_span!("queue.dequeue", worker_id, count);
        let _enter = span.enter();

        let lease_ttl = duration_micros(self.settings.lease_ttl);
        let claimed = self.db.with_tx(|tx| {
            let mut claimed = Vec::with_capacity(count);
            while claimed.len() < count {
                let now = now();
                let now_us = micros(now);
                let Some(id) = queue_repo::peek_ready(tx, now_us)? else {
                    break;
                };
                let lease = now_us.saturating_add(lease_ttl);
                queue_repo::transfer(tx, &id, PENDING, PROCESSING, now_us, 0, Some(lease))?;

                let mut job = load(tx, &id)?;
                job.status = JobStatus::Processing;
                job.worker_id = Some(worker_id.to_string());
                job.attempts += 1;
                job.started_at = Some(now);
                job.completed_at = None;
                job_repo::update(tx, &job.to_row()?)?;
                progress_repo::adjust(
                    tx,
                    &job.space_id,
                    ProgressDelta::claimed(),
                    &format_timestamp(now),
                )?;
                claimed.push(job);
            }
            Ok::<_, QueueError>(claimed)
        })?;

        if !claimed.is_empty() {
            tracing::debug!(claimed = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    /// Marks a processing job completed with `result`.
    ///
    /// Returns `false` without touching any counter when the job is not in
    /// `processing` (already completed, failed, cancelled or waiting).
    pub fn complete(&self, job_id: &str, result: Value) -> Result<bool, QueueError> {
        self.db.with_tx(|tx| {
            let mut job = load(tx, job_id)?;
            let now = now();
            if !queue_repo::transfer(tx, job_id, PROCESSING, COMPLETED, micros(now), 0, None)? {
                log::debug!("complete({}) ignored: job is {}", job_id, job.status);
                return Ok(false);
            }

            let started = job.started_at.unwrap_or(job.created_at);
            let elapsed = (now - started).num_microseconds().unwrap_or(0).max(0) as f64 / 1e6;

            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.output_data = Some(result);
            job_repo::update(tx, &job.to_row()?)?;

            counters::incr(tx, counters::TOTAL_COMPLETED, 1.0)?;
            counters::incr(tx, counters::TOTAL_PROCESSING_TIME, elapsed)?;
            progress_repo::adjust(
                tx,
                &job.space_id,
                ProgressDelta::completed(),
                &format_timestamp(now),
            )?;
            Ok(true)
        })
    }

    /// Records a failed attempt.
    ///
    /// With `retry` and attempts left, the job goes back to `pending` ready
    /// no earlier than `backoff_base * 2^attempts` from now. Otherwise it
    /// moves to `failed` for good. A pending cancel request takes precedence
    /// over both and the job ends `cancelled`.
    pub fn fail(&self, job_id: &str, error: &str, retry: bool) -> Result<FailOutcome, QueueError> {
        self.db.with_tx(|tx| {
            let job = load(tx, job_id)?;
            if queue_repo::membership(tx, job_id)?.as_deref() != Some(PROCESSING) {
                log::debug!("fail({}) ignored: job is {}", job_id, job.status);
                return Ok(FailOutcome::NotProcessing);
            }
            if job.cancel_requested {
                log::debug!("fail({}) after cancel request: {}", job_id, error);
                cancel_processing(tx, job, now())?;
                return Ok(FailOutcome::Cancelled);
            }
            self.fail_processing(tx, job, error, retry, now())
        })
    }

    fn fail_processing(
        &self,
        conn: &Connection,
        mut job: PipelineJob,
        error: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let ts = format_timestamp(now);
        job.error_message = Some(error.to_string());

        if retry && job.attempts < job.max_attempts {
            let delay =
                score::backoff(self.settings.backoff_base, job.attempts, self.settings.max_backoff);
            let delay_us = duration_micros(delay);
            let retry_at_us = micros(now).saturating_add(delay_us);
            let retry_at = now
                .checked_add_signed(chrono::Duration::microseconds(delay_us))
                .unwrap_or(now);

            job.status = JobStatus::Retrying;
            queue_repo::transfer(
                conn,
                &job.id,
                PROCESSING,
                PENDING,
                score::pending_score(job.priority, retry_at_us),
                retry_at_us,
                None,
            )?;
            job_repo::update(conn, &job.to_row()?)?;
            counters::incr(conn, counters::TOTAL_RETRIES, 1.0)?;
            progress_repo::adjust(conn, &job.space_id, ProgressDelta::retried(), &ts)?;

            log::info!(
                "Job {} attempt {}/{} failed, retrying in {:?}: {}",
                job.id,
                job.attempts,
                job.max_attempts,
                delay,
                error
            );
            Ok(FailOutcome::Retrying {
                attempts: job.attempts,
                retry_at,
            })
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            queue_repo::transfer(conn, &job.id, PROCESSING, FAILED, micros(now), 0, None)?;
            job_repo::update(conn, &job.to_row()?)?;
            counters::incr(conn, counters::TOTAL_FAILED, 1.0)?;
            progress_repo::adjust(conn, &job.space_id, ProgressDelta::failed(), &ts)?;

            log::warn!(
                "Job {} failed after {} attempt(s): {}",
                job.id,
                job.attempts,
                error
            );
            Ok(FailOutcome::Failed)
        }
    }

    /// Cancels a job.
    ///
    /// A pending job is removed at once. A processing job is flagged and its
    /// worker stops at the next checkpoint, calling `acknowledge_cancel`.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, QueueError> {
        self.db.with_tx(|tx| cancel_in(tx, job_id))
    }

    /// Cancels every job whose id was synthesized for `batch_id`.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<BatchCancellation, QueueError> {
        let prefix = format!("{}-", batch_id);
        self.db.with_tx(|tx| {
            let mut summary = BatchCancellation {
                batch_id: batch_id.to_string(),
                ..BatchCancellation::default()
            };
            for id in job_repo::ids_with_prefix(tx, &prefix)? {
                match cancel_in(tx, &id)? {
                    CancelOutcome::Cancelled => summary.cancelled += 1,
                    CancelOutcome::Requested => summary.requested += 1,
                    CancelOutcome::AlreadyFinished => summary.already_finished += 1,
                }
            }
            log::info!(
                "Batch {}: {} cancelled, {} in flight flagged",
                batch_id,
                summary.cancelled,
                summary.requested
            );
            Ok(summary)
        })
    }

    /// Whether cancellation has been requested for a job.
    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        self.db
            .with_conn(|conn| job_repo::cancel_requested(conn, job_id))?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    /// Finalizes the cancellation of a processing job.
    ///
    /// Returns `false` when the job is no longer in `processing`.
    pub fn acknowledge_cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        self.db.with_tx(|tx| {
            let job = load(tx, job_id)?;
            cancel_processing(tx, job, now())
        })
    }

    /// Extends every lease held by `worker_id`. Returns how many were renewed.
    pub fn renew_leases(&self, worker_id: &str) -> Result<usize, QueueError> {
        let expires_at = micros(now()).saturating_add(duration_micros(self.settings.lease_ttl));
        Ok(self
            .db
            .with_conn(|conn| queue_repo::renew_leases(conn, worker_id, expires_at))?)
    }

    /// Treats every expired lease as a failed attempt. Returns the reaped ids.
    pub fn reap_expired(&self) -> Result<Vec<String>, QueueError> {
        let reaped = self.db.with_tx(|tx| {
            let now = now();
            let expired = queue_repo::expired_leases(tx, micros(now))?;
            for id in &expired {
                let job = load(tx, id)?;
                let owner = job.worker_id.clone().unwrap_or_else(|| "unknown".to_string());
                log::warn!("Lease expired for job {} (worker {})", id, owner);
                if job.cancel_requested {
                    cancel_processing(tx, job, now)?;
                } else {
                    let reason = format!("lease expired (worker {})", owner);
                    self.fail_processing(tx, job, &reason, true, now)?;
                }
                counters::incr(tx, counters::TOTAL_REAPED, 1.0)?;
            }
            Ok::<_, QueueError>(expired)
        })?;
        Ok(reaped)
    }

    pub fn get_job(&self, job_id: &str) -> Result<PipelineJob, QueueError> {
        let row = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        PipelineJob::from_row(row)
    }

    /// The set a job currently belongs to; `None` once cancelled.
    pub fn membership(&self, job_id: &str) -> Result<Option<QueueSet>, QueueError> {
        let set = self
            .db
            .with_conn(|conn| queue_repo::membership(conn, job_id))?;
        set.map(|s| {
            s.parse::<QueueSet>().map_err(|reason| QueueError::CorruptRecord {
                id: job_id.to_string(),
                reason,
            })
        })
        .transpose()
    }

    /// Progress counters for a space. Unknown spaces read as all zeros.
    pub fn get_progress(&self, space_id: &str) -> Result<SpaceProgress, QueueError> {
        let row = self
            .db
            .with_conn(|conn| progress_repo::find(conn, space_id))?;
        Ok(row
            .map(SpaceProgress::from_row)
            .unwrap_or_else(|| SpaceProgress::empty(space_id)))
    }

    /// Stores the observed completion rate and ETA for a space.
    pub fn update_rate(
        &self,
        space_id: &str,
        rate_per_second: f64,
        eta_seconds: Option<f64>,
    ) -> Result<bool, QueueError> {
        let ts = format_timestamp(now());
        Ok(self.db.with_conn(|conn| {
            progress_repo::set_rate(conn, space_id, rate_per_second, eta_seconds, &ts)
        })?)
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let stats = self.db.with_conn(|conn| {
            let totals = counters::get_all(conn)?;
            let get = |name: &str| totals.get(name).copied().unwrap_or(0.0);

            let total_completed = get(counters::TOTAL_COMPLETED);
            let avg_processing_time = if total_completed > 0.0 {
                get(counters::TOTAL_PROCESSING_TIME) / total_completed
            } else {
                0.0
            };

            Ok(QueueStats {
                pending: queue_repo::count(conn, PENDING)?,
                processing: queue_repo::count(conn, PROCESSING)?,
                completed: queue_repo::count(conn, COMPLETED)?,
                failed: queue_repo::count(conn, FAILED)?,
                total_enqueued: get(counters::TOTAL_ENQUEUED) as u64,
                total_completed: total_completed as u64,
                total_failed: get(counters::TOTAL_FAILED) as u64,
                total_retries: get(counters::TOTAL_RETRIES) as u64,
                total_cancelled: get(counters::TOTAL_CANCELLED) as u64,
                total_reaped: get(counters::TOTAL_REAPED) as u64,
                avg_processing_time,
            })
        })?;
        Ok(stats)
    }

    /// Fails loudly when the store is unreachable.
    pub fn ping(&self) -> Result<(), QueueError> {
        Ok(self.db.ping()?)
    }
}

fn load(conn: &Connection, job_id: &str) -> Result<PipelineJob, QueueError> {
    let row = job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
    PipelineJob::from_row(row)
}

fn insert_pending(conn: &Connection, jobs: Vec<PipelineJob>) -> Result<Vec<String>, QueueError> {
    let ts = format_timestamp(now());
    let mut per_space: BTreeMap<String, i64> = BTreeMap::new();
    let mut ids = Vec::with_capacity(jobs.len());

    for mut job in jobs {
        if job_repo::find_by_id(conn, &job.id)?.is_some() {
            return Err(QueueError::DuplicateJob(job.id));
        }
        job.priority = score::clamp_priority(job.priority);
        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.cancel_requested = false;

        job_repo::insert(conn, &job.to_row()?)?;
        queue_repo::insert(
            conn,
            &job.id,
            PENDING,
            score::pending_score(job.priority, micros(job.created_at)),
            0,
        )?;
        *per_space.entry(job.space_id.clone()).or_default() += 1;
        ids.push(job.id);
    }

    if !ids.is_empty() {
        counters::incr(conn, counters::TOTAL_ENQUEUED, ids.len() as f64)?;
    }
    for (space_id, n) in per_space {
        progress_repo::adjust(conn, &space_id, ProgressDelta::enqueued(n), &ts)?;
    }
    log::debug!("Enqueued {} job(s)", ids.len());
    Ok(ids)
}

fn cancel_in(conn: &Connection, job_id: &str) -> Result<CancelOutcome, QueueError> {
    let mut job = load(conn, job_id)?;
    let now = now();
    let ts = format_timestamp(now);

    match queue_repo::membership(conn, job_id)?.as_deref() {
        Some(PENDING) => {
            queue_repo::remove_from(conn, job_id, PENDING)?;
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            job_repo::update(conn, &job.to_row()?)?;
            counters::incr(conn, counters::TOTAL_CANCELLED, 1.0)?;
            progress_repo::adjust(conn, &job.space_id, ProgressDelta::cancelled_from_pending(), &ts)?;
            log::info!("Job {} cancelled before claim", job_id);
            Ok(CancelOutcome::Cancelled)
        }
        Some(PROCESSING) => {
            job_repo::set_cancel_requested(conn, job_id, &ts)?;
            log::info!("Job {} cancel requested while in flight", job_id);
            Ok(CancelOutcome::Requested)
        }
        _ => Ok(CancelOutcome::AlreadyFinished),
    }
}

fn cancel_processing(
    conn: &Connection,
    mut job: PipelineJob,
    now: DateTime<Utc>,
) -> Result<bool, QueueError> {
    if !queue_repo::remove_from(conn, &job.id, PROCESSING)? {
        return Ok(false);
    }
    let ts = format_timestamp(now);
    job.status = JobStatus::Cancelled;
    job.completed_at = Some(now);
    job.error_message = Some("cancelled".to_string());
    job.cancel_requested = true;
    job_repo::update(conn, &job.to_row()?)?;
    counters::incr(conn, counters::TOTAL_CANCELLED, 1.0)?;
    progress_repo::adjust(
        conn,
        &job.space_id,
        ProgressDelta::cancelled_from_processing(),
        &ts,
    )?;
    log::info!("Job {} cancelled in flight", job.id);
    Ok(true)
}
