//! Configuration types for the memory core

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MemoryError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChimeraConfig {
    /// Memory actor configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Durable store configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Memory actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// STM ring capacity per user
    pub stm_limit: usize,

    /// Number of turns evicted per overflow batch
    pub cleanup_batch_size: usize,

    /// Deadline for a single gateway call, retries included
    pub query_timeout_seconds: u64,

    /// Maximum number of tries per gateway call
    pub retry_attempts: usize,

    /// Fixed delay between gateway tries
    pub retry_delay_seconds: u64,

    /// Maximum number of characters returned by `get_context`
    pub context_max_length: usize,

    /// Minimum importance for long-term promotion
    pub importance_threshold: u32,

    /// Record every gateway call and its latency
    pub performance_log_enabled: bool,

    /// Maximum number of characters in one stored message
    pub max_content_length: usize,

    /// Text placed between turns in the flattened context
    pub context_separator: String,

    /// What to do with evicted turns that were never promoted
    pub eviction_policy: EvictionPolicy,

    /// Prepend recent long-term turns to the context window
    pub include_long_term_context: bool,

    /// How many long-term turns to fetch for the context window
    pub long_term_context_limit: usize,

    /// Hand unpromoted STM turns to the cleanup batcher on shutdown
    pub flush_stm_on_shutdown: bool,

    /// Period of the failed-promotion retry sweep
    pub sweep_interval_seconds: u64,

    /// Sweep retries before a failed promotion is abandoned
    pub sweep_max_attempts: u32,

    /// Bound of the actor's inbound request channel
    pub inbound_queue_capacity: usize,

    /// Maximum number of gateway calls in flight
    pub max_concurrent_queries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stm_limit: 25,
            cleanup_batch_size: 10,
            query_timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_seconds: 1,
            context_max_length: 5000,
            importance_threshold: 5,
            performance_log_enabled: true,
            max_content_length: 4096,
            context_separator: "\n".to_string(),
            eviction_policy: EvictionPolicy::Archive,
            include_long_term_context: false,
            long_term_context_limit: 5,
            flush_stm_on_shutdown: true,
            sweep_interval_seconds: 60,
            sweep_max_attempts: 3,
            inbound_queue_capacity: 256,
            max_concurrent_queries: 8,
        }
    }
}

impl MemoryConfig {
    /// Gateway deadline as a `Duration`
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    /// Gateway retry delay as a `Duration`
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Sweep period as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Check the invariants the memory tiers rely on.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.stm_limit == 0 {
            return Err(invalid("stm_limit must be at least 1"));
        }
        if self.cleanup_batch_size == 0 || self.cleanup_batch_size > self.stm_limit {
            return Err(invalid(format!(
                "cleanup_batch_size must be between 1 and stm_limit ({}), got {}",
                self.stm_limit, self.cleanup_batch_size
            )));
        }
        if self.retry_attempts == 0 {
            return Err(invalid("retry_attempts must be at least 1"));
        }
        if self.query_timeout_seconds == 0 {
            return Err(invalid("query_timeout_seconds must be at least 1"));
        }
        if self.context_max_length == 0 {
            return Err(invalid("context_max_length must be at least 1"));
        }
        if self.max_content_length == 0 {
            return Err(invalid("max_content_length must be at least 1"));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(invalid("inbound_queue_capacity must be at least 1"));
        }
        if self.max_concurrent_queries == 0 {
            return Err(invalid("max_concurrent_queries must be at least 1"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(invalid("sweep_interval_seconds must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> MemoryError {
    MemoryError::Configuration(message.into())
}

/// Policy for evicted turns that never reached long-term memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Write them to the archive tier in one batch
    #[default]
    Archive,
    /// Drop them
    Discard,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store address: `memory`, `mem://`, `rocksdb://<path>`, `ws://<host>`
    pub url: String,

    /// SurrealDB namespace
    pub namespace: String,

    /// SurrealDB database
    pub database: String,

    /// Root username for remote servers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Root password for remote servers
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "chimera".to_string(),
            database: "memory".to_string(),
            username: None,
            password: None,
        }
    }
}

impl StorageConfig {
    /// Whether the in-process backend is selected instead of SurrealDB
    pub fn is_in_process(&self) -> bool {
        self.url == "memory"
    }
}

/// Builder for ChimeraConfig
pub struct ConfigBuilder {
    config: ChimeraConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ChimeraConfig::default(),
        }
    }

    /// Set memory configuration
    pub fn memory(mut self, config: MemoryConfig) -> Self {
        self.config.memory = config;
        self
    }

    /// Set storage configuration
    pub fn storage(mut self, config: StorageConfig) -> Self {
        self.config.storage = config;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ChimeraConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChimeraConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (chimera.toml, then the path in CHIMERA_CONFIG_PATH)
    /// 3. Environment variable overrides (`CHIMERA_MEMORY__STM_LIMIT=40`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ChimeraConfig::default()))
            .merge(Toml::file("chimera.toml"));

        if let Ok(path) = std::env::var("CHIMERA_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ChimeraConfig = figment
            .merge(Env::prefixed("CHIMERA_").split("__"))
            .extract()
            .map_err(|e| {
                MemoryError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// The format follows the extension: `.yaml`/`.yml`, `.json`, anything
    /// else is read as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Json, Serialized, Toml, Yaml},
        };

        let path = path.as_ref();
        let figment = Figment::from(Serialized::defaults(ChimeraConfig::default()));
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };

        let config: ChimeraConfig = figment.extract().map_err(|e| {
            MemoryError::Configuration(format!("Failed to load configuration file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        if self.storage.url.trim().is_empty() {
            return Err(invalid("storage.url must not be empty"));
        }
        Ok(())
    }
}
