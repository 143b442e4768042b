//! Health check command.
//!
//! Probes the ingestion health endpoint and shows the queue depth. The
//! circuit breaker shown belongs to this CLI process, not to a running
//! `uploader-worker`.

use anyhow::Result;
use serde::Serialize;

use uploader_core::config::Config;
use uploader_core::orchestrator::{HealthSnapshot, UploadOrchestrator};

use crate::output::{self, OutputFormat};

const BREAKER_SCOPE: &str = "local";

#[derive(Serialize)]
struct HealthReport {
    endpoint: String,
    endpoint_healthy: bool,
    breaker_scope: &'static str,
    #[serde(flatten)]
    pipeline: HealthSnapshot,
}

impl HealthReport {
    fn details(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Endpoint", self.endpoint.clone()),
            (
                "Endpoint status",
                if self.endpoint_healthy { "healthy" } else { "unreachable" }.to_string(),
            ),
            (
                "Circuit breaker (this process)",
                output::paint_status(&self.pipeline.breaker_state.to_string()),
            ),
            ("Queue depth", self.pipeline.queue_depth.to_string()),
            ("Timestamp", self.pipeline.timestamp.to_rfc3339()),
        ]
    }
}

pub async fn execute(orchestrator: &UploadOrchestrator, config: &Config, format: OutputFormat) -> Result<()> {
    let report = HealthReport {
        endpoint: config.ingestion.base_url.clone(),
        endpoint_healthy: orchestrator.endpoint_healthy().await,
        breaker_scope: BREAKER_SCOPE,
        pipeline: orchestrator.health_snapshot().await?,
    };

    match format {
        OutputFormat::Table => {
            output::print_header("Pipeline Health");
            for (label, value) in report.details() {
                output::print_detail(label, &value);
            }

            if report.endpoint_healthy {
                output::print_success("Ingestion endpoint is reachable");
            } else {
                output::print_error("Ingestion endpoint is not healthy");
            }
        }
        _ => output::print_item(&report, format)?,
    }

    Ok(())
}
