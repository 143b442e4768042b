//! Builds the in-process pipeline the commands operate on.

use anyhow::{Context, Result};

use uploader_core::config::Config;
use uploader_core::orchestrator::UploadOrchestrator;
use uploader_core::telemetry::{self, LogFormat, LoggingConfig};

/// Settings given on the command line, applied on top of the loaded config.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_file: Option<String>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub scraper_id: Option<String>,
    pub database_url: Option<String>,
    pub log_level: String,
}

/// Load configuration from file/environment and apply command-line overrides.
pub fn load_config(overrides: &Overrides) -> Result<Config> {
    let mut config = Config::resolve(overrides.config_file.as_deref())?;

    if let Some(url) = &overrides.url {
        config.ingestion.base_url = url.clone();
    }
    if let Some(key) = &overrides.api_key {
        config.ingestion.api_key = Some(key.clone());
    }
    if let Some(scraper_id) = &overrides.scraper_id {
        config.ingestion.scraper_id = scraper_id.clone();
    }
    if let Some(database_url) = &overrides.database_url {
        config.queue.database_url = database_url.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Install compact stderr logging so command output on stdout stays clean.
pub fn init_logging(config: &Config, level: &str) -> Result<()> {
    let mut logging = LoggingConfig::from_observability(&config.observability).with_format(LogFormat::Compact);
    logging.level = level.to_string();
    if let Some(key) = &config.ingestion.api_key {
        logging = logging.with_secret(key.clone());
    }
    telemetry::init_logging(&logging)
}

/// Open the job store and wire up the orchestrator.
pub async fn connect(config: &Config) -> Result<UploadOrchestrator> {
    UploadOrchestrator::from_config(config)
        .await
        .with_context(|| format!("Failed to open upload queue at {}", config.queue.database_url))
}
