use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::accelerator::DeviceInfo;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Shared job store. Defaults to `~/.batchpipe/data/queue.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            database_path: None,
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            accelerator: AcceleratorConfig::default(),
            inference: InferenceConfig::default(),
            progress: ProgressConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// The configured store path, or the per-user default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    300
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            max_backoff_secs: default_max_backoff(),
            lease_ttl_secs: default_lease_ttl(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Jobs claimed per dequeue call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// In-flight jobs per worker.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Attempts at reporting an outcome while the store is unreachable.
    #[serde(default = "default_report_retries")]
    pub report_retries: u32,
    /// Worker ids are `"{prefix}-worker-{i}"`; defaults to `pid{process id}`.
    #[serde(default)]
    pub id_prefix: Option<String>,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    10
}

fn default_idle_poll() -> u64 {
    500
}

fn default_error_backoff() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_report_retries() -> u32 {
    5
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            idle_poll_ms: default_idle_poll(),
            error_backoff_ms: default_error_backoff(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            report_retries: default_report_retries(),
            id_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Telemetry program, invoked with the nvidia-smi query arguments.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Percent.
    #[serde(default = "default_max_utilization")]
    pub max_utilization: f64,
    /// Fraction, 0.0-1.0.
    #[serde(default = "default_max_memory_utilization")]
    pub max_memory_utilization: f64,
    /// Fixed device list used instead of the telemetry command.
    #[serde(default)]
    pub static_devices: Option<Vec<DeviceInfo>>,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_command() -> String {
    "nvidia-smi".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

fn default_max_utilization() -> f64 {
    90.0
}

fn default_max_memory_utilization() -> f64 {
    0.85
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            command: default_command(),
            command_timeout_secs: default_command_timeout(),
            max_utilization: default_max_utilization(),
            max_memory_utilization: default_max_memory_utilization(),
            static_devices: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Characters of text sent to the extract and embed models.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_schema")]
    pub default_schema: String,
    #[serde(default = "default_ocr_prompt")]
    pub ocr_prompt: String,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_max_text_chars() -> usize {
    8000
}

fn default_schema() -> String {
    crate::queue::DEFAULT_SCHEMA.to_string()
}

fn default_ocr_prompt() -> String {
    "Extract all text from this document. Return raw text only.".to_string()
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            models: ModelsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            max_text_chars: default_max_text_chars(),
            default_schema: default_schema(),
            ocr_prompt: default_ocr_prompt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_ocr_model")]
    pub ocr: String,
    #[serde(default = "default_extract_model")]
    pub extract: String,
    #[serde(default = "default_embed_model")]
    pub embed: String,
}

fn default_ocr_model() -> String {
    "pixtral-large".to_string()
}

fn default_extract_model() -> String {
    "llama3.1:70b".to_string()
}

fn default_embed_model() -> String {
    "bge-m3:latest".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            ocr: default_ocr_model(),
            extract: default_extract_model(),
            embed: default_embed_model(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_ocr_timeout")]
    pub ocr_secs: u64,
    #[serde(default = "default_extract_timeout")]
    pub extract_secs: u64,
    #[serde(default = "default_embed_timeout")]
    pub embed_secs: u64,
}

fn default_ocr_timeout() -> u64 {
    120
}

fn default_extract_timeout() -> u64 {
    60
}

fn default_embed_timeout() -> u64 {
    30
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ocr_secs: default_ocr_timeout(),
            extract_secs: default_extract_timeout(),
            embed_secs: default_embed_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

fn default_window() -> u64 {
    60
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `batchpipe=debug,warn`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
