//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod broker;
mod messaging;

pub use broker::{BrokerConfig, TlsConfig};
pub use messaging::{
    ConsumerSettings, PublisherConfig, StreamOverride, StreamsConfig, WorkerConfig,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONSTELLATION_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CONSTELLATION";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONSTELLATION_LOG";

use serde::Deserialize;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker process and client connection.
    pub broker: BrokerConfig,
    /// Stream catalog tuning.
    pub streams: StreamsConfig,
    /// Durable consumer settings shared by every worker.
    pub consumers: ConsumerSettings,
    /// Pull loop settings shared by every worker.
    pub workers: WorkerConfig,
    /// Publish bridge settings.
    pub publisher: PublisherConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the runtime misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.batch_size == 0 {
            return Err(ConfigError::Invalid("workers.batch_size must be > 0".into()));
        }
        if self.workers.fetch_wait_ms == 0 {
            return Err(ConfigError::Invalid("workers.fetch_wait_ms must be > 0".into()));
        }
        if self.workers.backoff_min_ms > self.workers.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "workers.backoff_min_ms exceeds workers.backoff_max_ms".into(),
            ));
        }
        if self.consumers.max_deliver == 0 {
            return Err(ConfigError::Invalid("consumers.max_deliver must be > 0".into()));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(ConfigError::Invalid("publisher.queue_capacity must be > 0".into()));
        }
        if self.broker.external_url.is_none() && self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be set".into()));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
