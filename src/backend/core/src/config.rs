//! Configuration management.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{PipelineError, Result};

/// Environment prefix, e.g. `TENDERFLOW__INGESTION__API_KEY`.
pub const ENV_PREFIX: &str = "TENDERFLOW";

/// Main uploader configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Ingestion endpoint configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Drain loop configuration
    #[serde(default)]
    pub drain: DrainConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Base URL of the ingestion API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Static bearer credential
    pub api_key: Option<String>,

    /// Identifier reported as `scraperId`
    #[serde(default = "default_scraper_id")]
    pub scraper_id: String,

    /// Name of the records array in batch files and request bodies
    #[serde(default = "default_records_field")]
    pub records_field: String,

    /// Per-request timeout for uploads
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for the health probe
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            scraper_id: default_scraper_id(),
            records_field: default_records_field(),
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }
}

impl IngestionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// SQLite connection URL for the job store
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Attempts allowed per job before it is failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Jobs claimed per drain iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How long a claimed job stays invisible to other workers
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Pause between two jobs of one drain
    #[serde(default = "default_job_delay_ms")]
    pub job_delay_ms: u64,

    /// Interval between drains in the worker daemon
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Unit of the backoff curve (1000 ms = one second per step)
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            job_delay_ms: default_job_delay_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl DrainConfig {
    pub fn job_delay(&self) -> Duration {
        Duration::from_millis(self.job_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: json, pretty or compact
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus listener address (disabled when unset)
    pub metrics_listen: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_listen: None,
        }
    }
}

// Default value functions
fn default_base_url() -> String { "http://localhost:3457".to_string() }
fn default_scraper_id() -> String { "local-scraper".to_string() }
fn default_records_field() -> String { "tenders".to_string() }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_health_timeout_secs() -> u64 { 5 }
fn default_database_url() -> String { "sqlite://upload_queue.db".to_string() }
fn default_max_attempts() -> u32 { 5 }
fn default_batch_size() -> u32 { 10 }
fn default_lease_secs() -> u64 { 600 }
fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout_secs() -> u64 { 60 }
fn default_job_delay_ms() -> u64 { 1000 }
fn default_poll_interval_secs() -> u64 { 60 }
fn default_backoff_unit_ms() -> u64 { 1000 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` when given, otherwise from the environment alone.
    /// Invalid settings are an error in both cases.
    pub fn resolve(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path)
                .with_context(|| format!("Failed to load config file {}", path)),
            None => Self::load().context("Failed to load configuration from environment"),
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingestion.base_url.trim().is_empty() {
            return Err(PipelineError::configuration("ingestion.base_url must not be empty"));
        }
        if self.ingestion.records_field.trim().is_empty() {
            return Err(PipelineError::configuration("ingestion.records_field must not be empty"));
        }
        if self.queue.max_attempts == 0 {
            return Err(PipelineError::configuration("queue.max_attempts must be at least 1"));
        }
        if self.queue.batch_size == 0 {
            return Err(PipelineError::configuration("queue.batch_size must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(PipelineError::configuration("breaker.failure_threshold must be at least 1"));
        }
        Ok(())
    }
}
