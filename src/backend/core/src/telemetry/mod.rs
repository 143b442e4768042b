//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output with credential redaction
//! - **Metrics**: upload outcomes, request latency, queue depth, breaker state

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact, LogFormat, LoggingConfig, RedactionConfig, SensitiveFieldRedactor};
pub use metrics::{init_metrics, UploadMetrics};
