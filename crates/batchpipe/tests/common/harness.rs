//! Test harness for isolated queue and pool execution.
//!
//! Each harness owns a temp directory holding its job store file, so tests
//! can open several independent handles on the same store.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use batchpipe::accelerator::{StaticTelemetry, Thresholds};
use batchpipe::worker::PoolSettings;
use batchpipe::{
    AcceleratorOrchestrator, Database, DeviceInfo, InferenceClient, JobQueue, QueueSettings,
    WorkerPool,
};

use super::builders::device;

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub queue: JobQueue,
    pub settings: QueueSettings,
}

impl TestHarness {
    /// Harness whose retries are immediately claimable.
    pub fn new() -> Self {
        Self::with_settings(QueueSettings {
            backoff_base: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..QueueSettings::default()
        })
    }

    pub fn with_settings(settings: QueueSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("queue.db");
        let db = Database::open(&db_path).expect("Failed to open job store");
        Self {
            queue: JobQueue::new(db, settings.clone()),
            temp_dir,
            db_path,
            settings,
        }
    }

    /// A second, independent handle on the same store file.
    pub fn open_another(&self) -> JobQueue {
        let db = Database::open(&self.db_path).expect("Failed to open job store");
        JobQueue::new(db, self.settings.clone())
    }

    pub fn orchestrator(devices: Vec<DeviceInfo>) -> Arc<AcceleratorOrchestrator> {
        Arc::new(AcceleratorOrchestrator::new(
            Arc::new(StaticTelemetry::new(devices)),
            Duration::from_secs(5),
            Thresholds::default(),
        ))
    }

    /// A pool over this harness' store with two healthy devices.
    pub fn pool(
        &self,
        client: Arc<dyn InferenceClient>,
        workers: usize,
        max_concurrent: usize,
    ) -> WorkerPool {
        let mut settings = PoolSettings {
            workers,
            id_prefix: "test".to_string(),
            reap_interval: Duration::from_millis(50),
            ..PoolSettings::default()
        };
        settings.worker.max_concurrent = max_concurrent;
        settings.worker.batch_size = max_concurrent;
        settings.worker.idle_poll = Duration::from_millis(10);
        settings.worker.error_backoff = Duration::from_millis(10);

        WorkerPool::new(
            self.queue.clone(),
            Self::orchestrator(vec![device(0, 20, 40), device(1, 10, 60)]),
            client,
            settings,
        )
    }

    /// Asserts that each job's status names the one queue set holding its id.
    pub fn assert_partition(&self, ids: &[String]) {
        for id in ids {
            let status = self.queue.get_job(id).unwrap().status;
            assert_eq!(
                self.queue.membership(id).unwrap(),
                status.queue_set(),
                "job {} is {} but stored in another set",
                id,
                status
            );
        }
    }

    /// Polls `cond` every 10ms for up to `timeout`.
    pub async fn wait_for<F: Fn() -> bool>(&self, timeout: Duration, cond: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }
}
