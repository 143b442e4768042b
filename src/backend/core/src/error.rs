//! Error handling for the upload pipeline.
//!
//! This module provides:
//! - One error type ([`PipelineError`]) carrying a machine-readable [`ErrorCode`]
//! - The delivery taxonomy (permanent vs transient vs terminal failures)
//! - User-facing messages vs detailed internal messages
//! - Error logging with tracing integration and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use uploader_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn parse(bytes: &[u8]) -> Result<serde_json::Value> {
//!     serde_json::from_slice(bytes).with_error_code(ErrorCode::SerializationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// The delivery codes double as the classification the orchestrator matches on
/// when deciding between `COMPLETED`, `RETRY` and `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Payload Errors (1000-1099)
    SourceNotFound,
    SerializationError,

    // Delivery Errors (2000-2099)
    PermanentClientError,
    RateLimited,
    ServerError,
    NetworkError,
    CircuitOpen,
    MaxAttemptsExceeded,

    // Store Errors (3000-3099)
    StoreError,
    StoreConnectionFailed,
    JobNotFound,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::SourceNotFound => 1000,
            Self::SerializationError => 1001,

            Self::PermanentClientError => 2000,
            Self::RateLimited => 2001,
            Self::ServerError => 2002,
            Self::NetworkError => 2003,
            Self::CircuitOpen => 2004,
            Self::MaxAttemptsExceeded => 2005,

            Self::StoreError => 3000,
            Self::StoreConnectionFailed => 3001,
            Self::JobNotFound => 3002,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Transient delivery failures: the job may be scheduled for another try.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError | Self::NetworkError | Self::CircuitOpen
        )
    }

    /// Store-layer failures abort the current processing cycle instead of
    /// being recorded against a job.
    pub const fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::StoreError | Self::StoreConnectionFailed | Self::JobNotFound
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "payload",
            2000..=2099 => "delivery",
            3000..=3099 => "store",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input from a producer
    Low,
    /// Operational issues (rate limits, remote outages)
    Medium,
    /// Failures that lose a job or need an operator
    High,
    /// The pipeline itself cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::SourceNotFound
            | ErrorCode::SerializationError
            | ErrorCode::JobNotFound => Self::Low,

            ErrorCode::RateLimited
            | ErrorCode::ServerError
            | ErrorCode::NetworkError
            | ErrorCode::CircuitOpen => Self::Medium,

            ErrorCode::PermanentClientError
            | ErrorCode::MaxAttemptsExceeded
            | ErrorCode::StoreError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, file, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Delay requested by the remote side before the next try
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// HTTP status observed from the ingestion endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for the upload pipeline.
///
/// Carries a structured code, a message safe to persist in `error_message`,
/// an optional internal message for logs, structured details and the source
/// error that caused it.
#[derive(Error, Debug)]
pub struct PipelineError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message recorded on the job and shown to operators
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl PipelineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both public and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// The payload referenced by a job cannot be resolved.
    pub fn source_not_found(source_ref: impl Into<String>) -> Self {
        let source_ref = source_ref.into();
        Self::new(ErrorCode::SourceNotFound, format!("source not found: {}", source_ref))
            .with_details(ErrorDetails::new().with_entity("source", source_ref))
    }

    /// The payload could not be parsed or serialized.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message.into())
    }

    /// The endpoint refused the batch (non-retryable 4xx or application-level rejection).
    pub fn client_rejected(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermanentClientError, reason.into())
    }

    /// The endpoint answered 429.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        let message = match retry_after {
            Some(delay) => format!("Rate limited. Retry after {} seconds", delay.as_secs()),
            None => "Rate limited".to_string(),
        };
        let mut details = ErrorDetails::new().with_status(429);
        if let Some(delay) = retry_after {
            details = details.with_retry_after(delay.as_secs());
        }
        Self::new(ErrorCode::RateLimited, message).with_details(details)
    }

    /// The endpoint answered 5xx.
    pub fn server_error(status: u16) -> Self {
        Self::new(ErrorCode::ServerError, format!("Server error: {}", status))
            .with_details(ErrorDetails::new().with_status(status))
    }

    /// The request never produced a response (connect failure, timeout, reset).
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message.into())
    }

    /// The circuit breaker refused the call without invoking it.
    pub fn circuit_open() -> Self {
        Self::new(ErrorCode::CircuitOpen, "Circuit breaker is OPEN")
    }

    /// The job ran out of attempts; wraps the last transient failure.
    pub fn max_attempts_exceeded(attempts: u32, last_error: Option<&str>) -> Self {
        let message = match last_error {
            Some(last) => format!("Max attempts exceeded after {} attempts: {}", attempts, last),
            None => format!("Max attempts exceeded after {} attempts", attempts),
        };
        Self::new(ErrorCode::MaxAttemptsExceeded, message)
            .with_context("attempts", attempts)
    }

    /// A job row was expected but is missing.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("upload job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("upload_job", id))
    }

    /// Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_store_failure(&self) -> bool {
        self.code.is_store_failure()
    }

    /// Delay requested by the endpoint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.details.retry_after_secs.map(Duration::from_secs)
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "pipeline_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| PipelineError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| PipelineError::new(ErrorCode::InternalError, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| PipelineError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for PipelineError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::JobNotFound, "The upload job was not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StoreConnectionFailed,
                "Unable to reach the job store",
            ),
            _ => (ErrorCode::StoreError, "A job store error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::StoreError,
            "Failed to migrate the job store schema",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            let status = status.as_u16();
            let mut mapped = match status {
                429 => Self::rate_limited(None),
                500..=599 => Self::server_error(status),
                _ => Self::client_rejected(format!("Client error: {}", status)),
            };
            mapped.internal_message = Some(error.to_string());
            return mapped.with_source(error);
        }

        let msg = if error.is_timeout() {
            "Ingestion request timed out"
        } else if error.is_connect() {
            "Failed to connect to the ingestion endpoint"
        } else {
            "Network error occurred"
        };

        Self::with_internal(ErrorCode::NetworkError, msg, error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::SourceNotFound, "source not found"),
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                (ErrorCode::SerializationError, "source is not readable as a batch")
            }
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => (ErrorCode::NetworkError, "Connection failed"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(ErrorCode::ServerError.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::CircuitOpen.is_retryable());

        assert!(!ErrorCode::SourceNotFound.is_retryable());
        assert!(!ErrorCode::SerializationError.is_retryable());
        assert!(!ErrorCode::PermanentClientError.is_retryable());
        assert!(!ErrorCode::MaxAttemptsExceeded.is_retryable());
        assert!(!ErrorCode::StoreError.is_retryable());
    }

    #[test]
    fn test_store_failures() {
        assert!(ErrorCode::StoreError.is_store_failure());
        assert!(ErrorCode::StoreConnectionFailed.is_store_failure());
        assert!(ErrorCode::JobNotFound.is_store_failure());
        assert!(!ErrorCode::ServerError.is_store_failure());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::SourceNotFound.category(), "payload");
        assert_eq!(ErrorCode::CircuitOpen.category(), "delivery");
        assert_eq!(ErrorCode::StoreError.category(), "store");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_source_not_found_message() {
        let error = PipelineError::source_not_found("/tmp/missing.json");
        assert_eq!(error.code(), ErrorCode::SourceNotFound);
        assert!(error.message().contains("not found"));
        assert_eq!(error.details().entity_id.as_deref(), Some("/tmp/missing.json"));
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let error = PipelineError::rate_limited(Some(Duration::from_secs(30)));
        assert_eq!(error.code(), ErrorCode::RateLimited);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(error.details().status_code, Some(429));

        let error = PipelineError::rate_limited(None);
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn test_max_attempts_wraps_last_error() {
        let error = PipelineError::max_attempts_exceeded(3, Some("[ServerError] Server error: 500"));
        assert_eq!(error.code(), ErrorCode::MaxAttemptsExceeded);
        assert!(error.message().contains("Server error: 500"));
        assert!(error.details().context.contains_key("attempts"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::SourceNotFound), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::RateLimited), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::MaxAttemptsExceeded), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_from_io_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error = PipelineError::from(io);
        assert_eq!(error.code(), ErrorCode::SourceNotFound);
    }

    #[test]
    fn test_error_context_trait() {
        let parsed: Result<serde_json::Value> =
            serde_json::from_str::<serde_json::Value>("{not json")
                .with_error_code(ErrorCode::SerializationError);
        assert_eq!(parsed.unwrap_err().code(), ErrorCode::SerializationError);

        let missing: Result<u32> = None.context("nothing here");
        assert_eq!(missing.unwrap_err().code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_display() {
        let error = PipelineError::with_internal(
            ErrorCode::StoreError,
            "A job store error occurred",
            "database disk image is malformed",
        );

        let display = format!("{}", error);
        assert!(display.contains("StoreError"));
        assert!(display.contains("A job store error occurred"));
        assert!(display.contains("malformed"));
    }
}
