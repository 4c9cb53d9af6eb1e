use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::stages::{StageSettings, Stages};
use super::worker::{Worker, WorkerSettings};
use crate::accelerator::AcceleratorOrchestrator;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Result, WorkerError};
use crate::inference::{InferenceClient, OllamaClient};
use crate::progress::{ProgressBroadcaster, ProgressTracker};
use crate::queue::{JobQueue, QueueSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub workers: usize,
    pub worker: WorkerSettings,
    pub stages: StageSettings,
    pub reap_interval: Duration,
    pub progress_window: Duration,
    /// Worker ids are `"{id_prefix}-worker-{i}"`.
    pub id_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.count.max(1),
            worker: WorkerSettings::from(&config.workers),
            stages: StageSettings::from(&config.inference),
            reap_interval: Duration::from_secs(config.queue.reap_interval_secs),
            progress_window: Duration::from_secs(config.progress.window_secs),
            id_prefix: config
                .workers
                .id_prefix
                .clone()
                .unwrap_or_else(default_id_prefix),
        }
    }
}

/// `pid{process id}`, unique among worker processes on one host.
pub fn default_id_prefix() -> String {
    format!("pid{}", std::process::id())
}

/// A set of workers sharing one queue and one orchestrator.
pub struct WorkerPool {
    queue: JobQueue,
    orchestrator: Arc<AcceleratorOrchestrator>,
    stages: Arc<Stages>,
    tracker: Arc<ProgressTracker>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        orchestrator: Arc<AcceleratorOrchestrator>,
        client: Arc<dyn InferenceClient>,
        settings: PoolSettings,
    ) -> Self {
        let stages = Arc::new(Stages::new(client, settings.stages.clone()));
        let tracker = Arc::new(ProgressTracker::new(
            queue.clone(),
            settings.progress_window,
            ProgressBroadcaster::default(),
        ));
        Self {
            queue,
            orchestrator,
            stages,
            tracker,
            settings,
        }
    }

    /// Opens the configured job store and inference client.
    pub fn from_config(config: &Config) -> Result<Self> {
        let path = config
            .resolved_database_path()
            .ok_or(WorkerError::NoDatabasePath)?;
        let db = Database::open(&path)?;
        let queue = JobQueue::new(db, QueueSettings::from(&config.queue));
        let orchestrator = Arc::new(AcceleratorOrchestrator::from_config(&config.accelerator));
        let client = Arc::new(OllamaClient::from_config(&config.inference)?);
        Ok(Self::new(queue, orchestrator, client, PoolSettings::from(config)))
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Polls the devices once, then launches the workers and the lease reaper.
    pub async fn start(self) -> RunningPool {
        let devices = self.orchestrator.get_status(true).await;
        if devices.is_empty() {
            warn!("No accelerator devices detected; device hints default to 0");
        }
        for device in &devices {
            info!(
                "Device {}: {} ({} MiB free of {} MiB, {}% util, {}C)",
                device.index,
                device.name,
                device.memory_free,
                device.memory_total,
                device.utilization,
                device.temperature
            );
        }

        let workers: Vec<Arc<Worker>> = (0..self.settings.workers)
            .map(|i| {
                Arc::new(
                    Worker::new(
                        format!("{}-worker-{}", self.settings.id_prefix, i),
                        self.queue.clone(),
                        Arc::clone(&self.orchestrator),
                        Arc::clone(&self.stages),
                        self.settings.worker.clone(),
                    )
                    .with_tracker(Arc::clone(&self.tracker)),
                )
            })
            .collect();

        let tasks = workers
            .iter()
            .map(|worker| tokio::spawn(Arc::clone(worker).start()))
            .collect();

        let handle = PoolHandle {
            workers: Arc::new(workers),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        };
        let reaper = tokio::spawn(reap_loop(
            self.queue.clone(),
            self.settings.reap_interval,
            handle.clone(),
        ));

        info!(
            "Started {} workers (batch_size={}, max_concurrent={})",
            self.settings.workers, self.settings.worker.batch_size, self.settings.worker.max_concurrent
        );

        RunningPool {
            handle,
            tasks,
            reaper,
            tracker: self.tracker,
        }
    }
}

/// Cloneable shutdown trigger for a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    workers: Arc<Vec<Arc<Worker>>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PoolHandle {
    /// Stops every worker and the reaper. In-flight jobs still finish.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Shutting down worker pool...");
        for worker in self.workers.iter() {
            worker.stop();
        }
        self.wake.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn jobs_processed(&self) -> u64 {
        self.workers.iter().map(|w| w.jobs_processed()).sum()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }
}

pub struct RunningPool {
    handle: PoolHandle,
    tasks: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
    tracker: Arc<ProgressTracker>,
}

impl RunningPool {
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Waits for every worker to drain and exit. Returns the jobs processed.
    pub async fn wait(self) -> std::result::Result<u64, WorkerError> {
        let mut first_error = None;
        for (i, joined) in join_all(self.tasks).await.into_iter().enumerate() {
            match joined {
                Ok(()) => debug!("Worker {} finished", i),
                Err(e) => {
                    error!("Worker {} panicked: {}", i, e);
                    first_error.get_or_insert_with(|| WorkerError::Join(e.to_string()));
                }
            }
        }

        self.handle.shutdown();
        if let Err(e) = self.reaper.await {
            error!("Lease reaper panicked: {}", e);
            first_error.get_or_insert_with(|| WorkerError::Join(e.to_string()));
        }

        info!("All workers have stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(self.handle.jobs_processed()),
        }
    }
}

async fn reap_loop(queue: JobQueue, interval: Duration, handle: PoolHandle) {
    while !handle.is_shutdown() {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = handle.wake.notified() => {}
        }
        if handle.is_shutdown() {
            break;
        }
        match queue.reap_expired() {
            Ok(reaped) if reaped.is_empty() => {}
            Ok(reaped) => info!("Reaped {} expired lease(s)", reaped.len()),
            Err(e) => warn!("Lease reaping failed: {}", e),
        }
    }
    debug!("Lease reaper stopped");
}
