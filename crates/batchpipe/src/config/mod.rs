pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, validate_config, ConfigFormat,
};
pub use schema::{
    AcceleratorConfig, Config, InferenceConfig, LoggingConfig, ModelsConfig, ProgressConfig,
    QueueConfig, TimeoutsConfig, WorkersConfig, CONFIG_VERSION,
};
