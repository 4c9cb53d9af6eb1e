use std::path::{Path, PathBuf};

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub const ENV_DATABASE_PATH: &str = "BATCHPIPE_DATABASE_PATH";
pub const ENV_INFERENCE_URL: &str = "BATCHPIPE_INFERENCE_URL";
pub const ENV_LOG_LEVEL: &str = "BATCHPIPE_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml` / `.yml` files are YAML; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

/// Loads, validates and env-overrides the config at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = load_config_from_str(&content, ConfigFormat::from_path(path))?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Applies `BATCHPIPE_*` environment variables on top of `config`.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(path) = non_empty_env(ENV_DATABASE_PATH) {
        config.database_path = Some(PathBuf::from(path));
    }
    if let Some(url) = non_empty_env(ENV_INFERENCE_URL) {
        config.inference.base_url = url;
    }
    if let Some(level) = non_empty_env(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Semantic checks the schema cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::Validation { message });

    if config.version != CONFIG_VERSION {
        return invalid(format!("Unsupported config version: {}", config.version));
    }

    let workers = &config.workers;
    if workers.count == 0 {
        return invalid("workers.count must be at least 1".to_string());
    }
    if workers.batch_size == 0 {
        return invalid("workers.batch_size must be at least 1".to_string());
    }
    if workers.max_concurrent == 0 {
        return invalid("workers.max_concurrent must be at least 1".to_string());
    }

    let queue = &config.queue;
    if queue.max_attempts == 0 {
        return invalid("queue.max_attempts must be at least 1".to_string());
    }
    if queue.lease_ttl_secs == 0 || queue.reap_interval_secs == 0 {
        return invalid("queue.lease_ttl_secs and queue.reap_interval_secs must be positive".to_string());
    }
    if queue.max_backoff_secs < queue.backoff_base_secs {
        return invalid("queue.max_backoff_secs must not be below queue.backoff_base_secs".to_string());
    }
    if workers.heartbeat_interval_secs == 0
        || workers.heartbeat_interval_secs >= queue.lease_ttl_secs
    {
        return invalid(format!(
            "workers.heartbeat_interval_secs must be between 1 and queue.lease_ttl_secs ({})",
            queue.lease_ttl_secs
        ));
    }

    let accel = &config.accelerator;
    if !(accel.max_utilization > 0.0 && accel.max_utilization <= 100.0) {
        return invalid(format!(
            "accelerator.max_utilization must be in (0, 100], got {}",
            accel.max_utilization
        ));
    }
    if !(accel.max_memory_utilization > 0.0 && accel.max_memory_utilization <= 1.0) {
        return invalid(format!(
            "accelerator.max_memory_utilization must be in (0, 1], got {}",
            accel.max_memory_utilization
        ));
    }
    if accel.command_timeout_secs == 0 {
        return invalid("accelerator.command_timeout_secs must be positive".to_string());
    }

    let inference = &config.inference;
    if !(inference.base_url.starts_with("http://") || inference.base_url.starts_with("https://")) {
        return invalid(format!(
            "inference.base_url must be an http(s) URL, got '{}'",
            inference.base_url
        ));
    }
    let t = &inference.timeouts;
    if t.ocr_secs == 0 || t.extract_secs == 0 || t.embed_secs == 0 {
        return invalid("inference.timeouts must all be positive".to_string());
    }
    if inference.max_text_chars == 0 {
        return invalid("inference.max_text_chars must be at least 1".to_string());
    }

    if config.progress.window_secs == 0 {
        return invalid("progress.window_secs must be positive".to_string());
    }

    Ok(())
}
