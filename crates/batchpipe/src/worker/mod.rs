//! Workers that claim jobs from the queue and run the pipeline stages.

pub mod pool;
pub mod stages;
#[allow(clippy::module_inception)]
pub mod worker;

pub use pool::{default_id_prefix, PoolHandle, PoolSettings, RunningPool, WorkerPool};
pub use stages::{truncate_chars, StageSettings, Stages, EMPTY_OCR_ERROR};
pub use worker::{Worker, WorkerSettings};
