use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{info_span, Instrument};

use super::stages::Stages;
use crate::accelerator::AcceleratorOrchestrator;
use crate::config::WorkersConfig;
use crate::error::StageError;
use crate::progress::{ProgressKind, ProgressTracker};
use crate::queue::{FailOutcome, JobQueue, PipelineJob, QueueError};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Upper bound on jobs claimed per `dequeue` call.
    pub batch_size: usize,
    /// Upper bound on jobs in flight in this worker.
    pub max_concurrent: usize,
    pub idle_poll: Duration,
    pub error_backoff: Duration,
    pub heartbeat_interval: Duration,
    /// Extra attempts at reporting an outcome while the store is unavailable.
    pub report_retries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkersConfig::default())
    }
}

impl From<&WorkersConfig> for WorkerSettings {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrent: config.max_concurrent.max(1),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            report_retries: config.report_retries,
        }
    }
}

/// Claims jobs from the queue and runs them, at most `max_concurrent` at once.
pub struct Worker {
    id: String,
    queue: JobQueue,
    orchestrator: Arc<AcceleratorOrchestrator>,
    stages: Arc<Stages>,
    tracker: Option<Arc<ProgressTracker>>,
    settings: WorkerSettings,
    running: AtomicBool,
    wake: Notify,
    processed: AtomicU64,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: JobQueue,
        orchestrator: Arc<AcceleratorOrchestrator>,
        stages: Arc<Stages>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            orchestrator,
            stages,
            tracker: None,
            settings,
            running: AtomicBool::new(true),
            wake: Notify::new(),
            processed: AtomicU64::new(0),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Jobs this worker has taken to an outcome (completed, retried, failed or cancelled).
    pub fn jobs_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Asks the claim loop to exit. In-flight jobs run to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    /// Runs the claim loop until [`stop`](Self::stop), then drains in-flight jobs.
    pub async fn start(self: Arc<Self>) {
        info!("Worker {} started", self.id);

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let mut in_flight = JoinSet::new();
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat());

        while self.is_running() {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(&self.id, joined);
            }

            let first = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if !self.is_running() {
                break;
            }

            let want = self
                .settings
                .batch_size
                .min(1 + semaphore.available_permits());
            let jobs = match self.queue.dequeue(&self.id, want) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!("Worker {} failed to claim jobs: {}", self.id, e);
                    drop(first);
                    self.pause(self.settings.error_backoff).await;
                    continue;
                }
            };
            if jobs.is_empty() {
                drop(first);
                self.pause(self.settings.idle_poll).await;
                continue;
            }

            debug!("Worker {} claimed {} job(s)", self.id, jobs.len());
            let mut first = Some(first);
            for job in jobs {
                // Only this loop acquires, so permits counted above are still free.
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let worker = Arc::clone(&self);
                in_flight.spawn(async move {
                    let _permit = permit;
                    worker.process_job(job).await;
                });
            }
        }

        debug!("Worker {} draining {} in-flight job(s)", self.id, in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            log_join(&self.id, joined);
        }
        heartbeat.abort();

        info!(
            "Worker {} stopped after {} job(s)",
            self.id,
            self.jobs_processed()
        );
    }

    /// Runs one claimed job and reports its outcome to the queue.
    pub async fn process_job(&self, job: PipelineJob) {
        let span = info_span!(
            "worker.job",
            worker_id = %self.id,
            job_id = %job.id,
            space_id = %job.space_id,
            job_type = job.job_type.as_str(),
            attempt = job.attempts,
        );
        self.run_job(job).instrument(span).await;
    }

    async fn run_job(&self, job: PipelineJob) {
        let started = Instant::now();
        let device = self.orchestrator.select_device().await;
        tracing::debug!(device, "device selected");

        let outcome = self
            .stages
            .run(&job, device, || self.cancel_requested(&job.id))
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let kind = match outcome {
            Ok(result) => {
                let completed = self
                    .report("complete", || self.queue.complete(&job.id, result.clone()))
                    .await;
                match completed {
                    Some(true) => {
                        tracing::info!(elapsed_ms, "job completed");
                        Some(ProgressKind::Completed)
                    }
                    Some(false) => {
                        tracing::warn!("job left processing before completion was recorded");
                        None
                    }
                    None => None,
                }
            }
            Err(StageError::Cancelled) => {
                let acknowledged = self
                    .report("acknowledge cancel", || self.queue.acknowledge_cancel(&job.id))
                    .await;
                tracing::info!(elapsed_ms, "job cancelled");
                acknowledged.filter(|done| *done).map(|_| ProgressKind::Cancelled)
            }
            Err(e) => {
                let retry = e.is_retryable();
                let message = e.to_string();
                let outcome = self
                    .report("fail", || self.queue.fail(&job.id, &message, retry))
                    .await;
                match outcome {
                    Some(FailOutcome::Retrying { attempts, retry_at }) => {
                        tracing::warn!(elapsed_ms, attempts, %retry_at, error = %message, "job failed, retrying");
                        Some(ProgressKind::Retrying)
                    }
                    Some(FailOutcome::Failed) => {
                        tracing::error!(elapsed_ms, error = %message, "job failed permanently");
                        Some(ProgressKind::Failed)
                    }
                    Some(FailOutcome::Cancelled) => {
                        tracing::info!(elapsed_ms, error = %message, "job cancelled after failure");
                        Some(ProgressKind::Cancelled)
                    }
                    Some(FailOutcome::NotProcessing) => {
                        tracing::warn!("job left processing before failure was recorded");
                        None
                    }
                    None => None,
                }
            }
        };

        self.processed.fetch_add(1, Ordering::Relaxed);

        if let (Some(kind), Some(tracker)) = (kind, &self.tracker) {
            if let Err(e) = tracker.record(&job.space_id, &job.id, kind) {
                warn!("Failed to update progress for space {}: {}", job.space_id, e);
            }
        }
    }

    fn cancel_requested(&self, job_id: &str) -> bool {
        match self.queue.is_cancel_requested(job_id) {
            Ok(requested) => requested,
            Err(e) => {
                warn!("Cancellation check failed for job {}: {}", job_id, e);
                false
            }
        }
    }

    /// Runs `op`, retrying store failures up to `report_retries` times.
    ///
    /// `None` means the outcome could not be recorded; the job's lease then
    /// expires and the reaper takes over.
    async fn report<T, F>(&self, what: &str, op: F) -> Option<T>
    where
        F: Fn() -> Result<T, QueueError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Some(value),
                Err(QueueError::Database(e)) if attempt < self.settings.report_retries => {
                    attempt += 1;
                    warn!(
                        "Worker {} could not {} (attempt {}/{}): {}",
                        self.id, what, attempt, self.settings.report_retries, e
                    );
                    tokio::time::sleep(self.settings.error_backoff).await;
                }
                Err(e) => {
                    error!("Worker {} gave up trying to {}: {}", self.id, what, e);
                    return None;
                }
            }
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let period = self.settings.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.queue.renew_leases(&self.id) {
                Ok(0) => {}
                Ok(n) => debug!("Worker {} renewed {} lease(s)", self.id, n),
                Err(e) => warn!("Worker {} failed to renew leases: {}", self.id, e),
            }
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }
}

fn log_join(worker_id: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Worker {} job task panicked: {}", worker_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{DeviceInfo, StaticTelemetry, Thresholds};
    use crate::db::Database;
    use crate::inference::{EmbedRequest, GenerateRequest, InferenceClient, InferenceError};
    use crate::progress::ProgressBroadcaster;
    use crate::queue::{JobStatus, JobType, QueueSet, QueueSettings};
    use crate::worker::stages::StageSettings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Embeds succeed after a delay; tracks peak concurrency.
    struct SlowEmbedder {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    impl SlowEmbedder {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl InferenceClient for SlowEmbedder {
        async fn generate(&self, _request: GenerateRequest) -> Result<String, InferenceError> {
            Ok("text".to_string())
        }

        async fn embed(&self, _request: EmbedRequest) -> Result<Vec<f32>, InferenceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(InferenceError::Transport("connection reset".into()))
            } else {
                Ok(vec![1.0, 2.0])
            }
        }
    }

    fn orchestrator() -> Arc<AcceleratorOrchestrator> {
        let device = DeviceInfo {
            index: 0,
            name: "Test GPU".into(),
            memory_total: 16_000,
            memory_used: 1_000,
            memory_free: 15_000,
            utilization: 5,
            temperature: 40,
        };
        Arc::new(AcceleratorOrchestrator::new(
            Arc::new(StaticTelemetry::new(vec![device])),
            Duration::from_secs(5),
            Thresholds::default(),
        ))
    }

    fn settings(max_concurrent: usize) -> WorkerSettings {
        WorkerSettings {
            batch_size: 4,
            max_concurrent,
            idle_poll: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            report_retries: 1,
        }
    }

    fn queue(settings: QueueSettings) -> JobQueue {
        JobQueue::new(Database::open_in_memory().unwrap(), settings)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_settings_from_config() {
        let config = WorkersConfig {
            batch_size: 0,
            max_concurrent: 3,
            ..WorkersConfig::default()
        };
        let settings = WorkerSettings::from(&config);
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_process_job_completes_and_tracks_progress() {
        let queue = queue(QueueSettings::default());
        let client = SlowEmbedder::new(Duration::ZERO, false);
        let stages = Arc::new(Stages::new(client, StageSettings::default()));
        let tracker = Arc::new(ProgressTracker::new(
            queue.clone(),
            Duration::from_secs(60),
            ProgressBroadcaster::default(),
        ));
        let worker = Worker::new("w-1", queue.clone(), orchestrator(), stages, settings(2))
            .with_tracker(tracker);

        let id = queue
            .enqueue(PipelineJob::new("s", JobType::Embed, json!({ "text": "hello" })))
            .unwrap();
        let job = queue.dequeue("w-1", 1).unwrap().remove(0);
        worker.process_job(job).await;

        let stored = queue.get_job(&id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.output_data.unwrap()["dimensions"], 2);
        assert_eq!(worker.jobs_processed(), 1);

        let progress = queue.get_progress("s").unwrap();
        assert!(progress.rate_per_second > 0.0);
        assert_eq!(progress.eta_seconds, Some(0.0));
    }

    #[tokio::test]
    async fn test_invalid_input_fails_without_retry() {
        let queue = queue(QueueSettings::default());
        let stages = Arc::new(Stages::new(
            SlowEmbedder::new(Duration::ZERO, false),
            StageSettings::default(),
        ));
        let worker = Worker::new("w-1", queue.clone(), orchestrator(), stages, settings(1));

        let id = queue
            .enqueue(PipelineJob::new("s", JobType::Embed, json!({})))
            .unwrap();
        let job = queue.dequeue("w-1", 1).unwrap().remove(0);
        worker.process_job(job).await;

        let stored = queue.get_job(&id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.error_message.unwrap().contains("input_data.text"));
    }

    #[tokio::test]
    async fn test_inference_failure_is_retried() {
        let queue = queue(QueueSettings {
            backoff_base: Duration::from_secs(60),
            ..QueueSettings::default()
        });
        let stages = Arc::new(Stages::new(
            SlowEmbedder::new(Duration::ZERO, true),
            StageSettings::default(),
        ));
        let worker = Worker::new("w-1", queue.clone(), orchestrator(), stages, settings(1));

        let id = queue
            .enqueue(PipelineJob::new("s", JobType::Embed, json!({ "text": "x" })))
            .unwrap();
        let job = queue.dequeue("w-1", 1).unwrap().remove(0);
        worker.process_job(job).await;

        let stored = queue.get_job(&id).unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(queue.membership(&id).unwrap(), Some(QueueSet::Pending));
        // Backoff keeps it out of reach for now.
        assert!(queue.dequeue("w-1", 1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_requested_before_processing() {
        let queue = queue(QueueSettings::default());
        let stages = Arc::new(Stages::new(
            SlowEmbedder::new(Duration::ZERO, false),
            StageSettings::default(),
        ));
        let worker = Worker::new("w-1", queue.clone(), orchestrator(), stages, settings(1));

        let id = queue
            .enqueue(PipelineJob::new("s", JobType::Embed, json!({ "text": "x" })))
            .unwrap();
        let job = queue.dequeue("w-1", 1).unwrap().remove(0);
        queue.cancel(&id).unwrap();
        worker.process_job(job).await;

        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(queue.membership(&id).unwrap(), None);
        assert_eq!(queue.get_progress("s").unwrap().cancelled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_respects_max_concurrent_and_drains() {
        let queue = queue(QueueSettings::default());
        let client = SlowEmbedder::new(Duration::from_millis(20), false);
        let stages = Arc::new(Stages::new(client.clone(), StageSettings::default()));
        let worker = Arc::new(Worker::new(
            "w-1",
            queue.clone(),
            orchestrator(),
            stages,
            settings(3),
        ));

        for _ in 0..12 {
            queue
                .enqueue(PipelineJob::new("s", JobType::Embed, json!({ "text": "x" })))
                .unwrap();
        }

        let handle = tokio::spawn(Arc::clone(&worker).start());
        wait_until(|| worker.jobs_processed() == 12).await;
        worker.stop();
        handle.await.unwrap();

        assert!(client.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.get_queue_stats().unwrap().completed, 12);
        assert_eq!(queue.get_progress("s").unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_renews_leases() {
        let queue = queue(QueueSettings {
            lease_ttl: Duration::from_millis(150),
            ..QueueSettings::default()
        });
        let client = SlowEmbedder::new(Duration::from_millis(400), false);
        let stages = Arc::new(Stages::new(client, StageSettings::default()));
        let worker = Arc::new(Worker::new(
            "w-1",
            queue.clone(),
            orchestrator(),
            stages,
            settings(1),
        ));

        let id = queue
            .enqueue(PipelineJob::new("s", JobType::Embed, json!({ "text": "x" })))
            .unwrap();

        let handle = tokio::spawn(Arc::clone(&worker).start());
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Without renewal the 150ms lease would have expired by now.
        assert!(queue.reap_expired().unwrap().is_empty());

        wait_until(|| worker.jobs_processed() == 1).await;
        worker.stop();
        handle.await.unwrap();
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Completed);
    }
}
