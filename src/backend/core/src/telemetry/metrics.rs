//! Prometheus metrics for the upload pipeline.
//!
//! Recording is always on. Without an installed recorder the `metrics`
//! macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use uploader_core::telemetry::metrics::UploadMetrics;
//!
//! UploadMetrics::record_outcome("completed");
//! UploadMetrics::set_queue_depth(12);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Histogram buckets for ingestion request durations (seconds).
const REQUEST_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder with an HTTP listener on `listen`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("upload_request_duration_seconds".to_string()),
            REQUEST_DURATION_BUCKETS,
        )?
        .install()?;

    register_metric_descriptions();

    tracing::info!(listen = %listen, "Metrics exporter listening");
    Ok(())
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    describe_counter!("uploads_total", "Upload jobs finished per outcome");
    describe_counter!("upload_attempts_total", "Requests sent to the ingestion endpoint");
    describe_histogram!(
        "upload_request_duration_seconds",
        "Ingestion request duration in seconds"
    );
    describe_gauge!("upload_queue_depth", "Upload jobs not yet completed or failed");
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0 closed, 1 open, 2 half-open)"
    );
    describe_counter!("circuit_breaker_trips_total", "Times the circuit breaker opened");
    describe_counter!("pipeline_errors_total", "Pipeline errors by code");
}

/// Pipeline-level metric helpers.
pub struct UploadMetrics;

impl UploadMetrics {
    /// Count a processing cycle outcome (`completed`, `retry`, `failed`).
    pub fn record_outcome(outcome: &'static str) {
        counter!("uploads_total", "outcome" => outcome).increment(1);
    }

    /// Count one request sent to the endpoint.
    pub fn record_attempt() {
        counter!("upload_attempts_total").increment(1);
    }

    /// Record the duration of one ingestion request.
    pub fn record_request_duration(seconds: f64, result: &'static str) {
        histogram!("upload_request_duration_seconds", "result" => result).record(seconds);
    }

    /// Set the current queue depth.
    pub fn set_queue_depth(depth: u64) {
        gauge!("upload_queue_depth").set(depth as f64);
    }
}
