//! Structured logging with JSON/pretty/compact formats and secret redaction.
//!
//! - JSON format for the worker daemon
//! - Pretty and compact formats for interactive use
//! - Redaction of bearer credentials in anything that is logged or persisted
//!   as an `error_message`

use serde::Deserialize;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Global redactor instance.
static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error or a full `EnvFilter` string)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Redaction configuration
    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: false,
            redaction: RedactionConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Build from the `observability` section of the uploader config.
    pub fn from_observability(config: &ObservabilityConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            format: config.log_format.parse().unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Also redact this literal value (typically the configured API key).
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redaction.secrets.push(secret);
        }
        self
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Configuration for sensitive data redaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    /// Whether redaction is enabled
    #[serde(default = "default_redaction_enabled")]
    pub enabled: bool,

    /// Regex patterns to redact
    #[serde(default = "default_redaction_patterns")]
    pub patterns: Vec<String>,

    /// Literal values to redact
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Replacement text for redacted values
    #[serde(default = "default_redaction_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_redaction_enabled(),
            patterns: default_redaction_patterns(),
            secrets: Vec::new(),
            replacement: default_redaction_replacement(),
        }
    }
}

/// Scrubs credentials out of free-form text.
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    patterns: Vec<regex::Regex>,
    replacement: String,
    enabled: bool,
}

impl SensitiveFieldRedactor {
    /// Create a new redactor from configuration. Invalid patterns are skipped.
    pub fn new(config: &RedactionConfig) -> Self {
        let mut patterns: Vec<regex::Regex> = config
            .patterns
            .iter()
            .filter_map(|pat| regex::Regex::new(pat).ok())
            .collect();

        patterns.extend(
            config
                .secrets
                .iter()
                .filter_map(|secret| regex::Regex::new(&regex::escape(secret)).ok()),
        );

        Self {
            patterns,
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    /// Redact every match of every pattern.
    pub fn redact(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }

        let mut result = value.to_string();
        for regex in &self.patterns {
            result = regex.replace_all(&result, self.replacement.as_str()).into_owned();
        }
        result
    }

    /// Get the global redactor instance.
    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }

    /// Install the global redactor. Only the first call wins.
    pub fn install(config: &RedactionConfig) {
        let _ = REDACTOR.set(SensitiveFieldRedactor::new(config));
    }
}

/// Redact with the global redactor.
pub fn redact(value: &str) -> String {
    SensitiveFieldRedactor::global().redact(value)
}

// Default value functions
fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_redaction_enabled() -> bool {
    true
}

fn default_redaction_replacement() -> String {
    "[REDACTED]".to_string()
}

fn default_redaction_patterns() -> Vec<String> {
    vec![
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+".to_string(),
        r"eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+".to_string(),
        r"(?i)(api[_-]?key|token)=[^&\s]+".to_string(),
    ]
}

/// Initialize the logging subsystem.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    SensitiveFieldRedactor::install(&config.redaction);

    let filter = EnvFilter::try_new(&config.level)?;

    match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}
