pub mod accelerator;
pub mod config;
pub mod db;
pub mod error;
pub mod inference;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod worker;

pub use accelerator::{AcceleratorOrchestrator, Capacity, DeviceInfo, TelemetrySource};
pub use config::{load_config, Config};
pub use db::{default_database_path, Database, DatabaseError};
pub use error::{BatchpipeError, ConfigError, LoggingError, Result, StageError, WorkerError};
pub use inference::{InferenceClient, InferenceError, OllamaClient};
pub use progress::{BatchStatus, ProgressBroadcaster, ProgressEvent, ProgressTracker};
pub use queue::{
    BatchRequest, JobQueue, JobStatus, JobType, PipelineJob, QueueError, QueueSettings,
    QueueStats, SpaceProgress,
};
pub use worker::{PoolHandle, RunningPool, Worker, WorkerPool};
