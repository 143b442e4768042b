//! Queue commands.
//!
//! Provides enqueue, upload, drain, and status operations on the upload queue.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;
use uuid::Uuid;

use uploader_core::jobs::{JobMetadata, UploadJob};
use uploader_core::orchestrator::UploadOrchestrator;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Batch file to upload
    #[arg(short, long)]
    file: PathBuf,

    /// Batch identifier (generated when omitted)
    #[arg(short, long)]
    batch_id: Option<String>,

    /// Job metadata as key=value, e.g. page_number=2 (repeatable)
    #[arg(short, long = "meta", value_parser = parse_key_val)]
    meta: Vec<(String, String)>,
}

#[derive(Args)]
pub struct UploadArgs {
    /// Batch file to upload
    #[arg(short, long)]
    file: PathBuf,

    /// Batch identifier (generated when omitted)
    #[arg(short, long)]
    batch_id: Option<String>,

    /// Job metadata as key=value (repeatable)
    #[arg(short, long = "meta", value_parser = parse_key_val)]
    meta: Vec<(String, String)>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// List the jobs of this batch instead of queue counters
    #[arg(short, long)]
    batch_id: Option<String>,
}

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Next Retry")]
    next_retry_at: String,
    #[tabled(rename = "Source")]
    source_ref: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&UploadJob> for JobRow {
    fn from(job: &UploadJob) -> Self {
        let id = job.id.to_string();
        Self {
            id: id.chars().take(8).collect(),
            status: output::paint_status(job.status.as_str()),
            attempts: format!("{}/{}", job.attempts, job.max_attempts),
            next_retry_at: job
                .next_retry_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            source_ref: job.source_ref.clone(),
            error: job.error_message.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    batch_id: String,
    source_ref: String,
}

// ── Argument Parsing ────────────────────────────────────────────────────────

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Numbers, booleans and JSON literals keep their type; everything else is a string.
fn to_metadata(pairs: Vec<(String, String)>) -> JobMetadata {
    pairs
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect()
}

/// Absolute path for the queue; a missing file is queued as given and will
/// fail when processed.
fn source_ref(file: &Path) -> String {
    match std::fs::canonicalize(file) {
        Ok(path) => path.display().to_string(),
        Err(_) => {
            output::print_warning(&format!("{} does not exist yet", file.display()));
            file.display().to_string()
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn enqueue(args: EnqueueArgs, orchestrator: &UploadOrchestrator, format: OutputFormat) -> Result<()> {
    let source_ref = source_ref(&args.file);
    let batch_id = args.batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let job_id = orchestrator
        .enqueue(&source_ref, &batch_id, to_metadata(args.meta))
        .await
        .context("Failed to enqueue upload job")?;

    let resp = EnqueueResponse {
        job_id: job_id.to_string(),
        batch_id,
        source_ref,
    };

    match format {
        OutputFormat::Table => {
            output::print_success("Upload job queued");
            output::print_detail("Job ID", &resp.job_id);
            output::print_detail("Batch ID", &resp.batch_id);
            output::print_detail("Source", &resp.source_ref);
        }
        _ => output::print_item(&resp, format)?,
    }
    Ok(())
}

pub async fn upload(args: UploadArgs, orchestrator: &UploadOrchestrator, format: OutputFormat) -> Result<()> {
    let source_ref = source_ref(&args.file);

    let report = orchestrator
        .upload(&source_ref, args.batch_id.as_deref(), to_metadata(args.meta))
        .await
        .context("Upload aborted")?;

    match format {
        OutputFormat::Table => {
            let status = report.status.as_str();
            match status {
                "completed" => output::print_success("Batch uploaded"),
                "retry" => output::print_warning("Upload deferred, the job will be retried"),
                _ => output::print_error("Upload failed"),
            }
            output::print_detail("Job ID", &report.job_id.to_string());
            output::print_detail("Batch ID", &report.batch_id);
            output::print_detail("Status", &output::paint_status(status));
            if let Some(error) = &report.error_message {
                output::print_detail("Error", error);
            }
            output::print_detail("Jobs processed", &report.drain.processed.to_string());
        }
        _ => output::print_item(&report, format)?,
    }
    Ok(())
}

pub async fn drain(orchestrator: &UploadOrchestrator, format: OutputFormat) -> Result<()> {
    let report = orchestrator.drain().await.context("Drain aborted")?;

    match format {
        OutputFormat::Table => {
            if report.processed == 0 {
                output::print_info("No ready jobs");
                return Ok(());
            }
            output::print_header("Drain");
            output::print_detail("Processed", &report.processed.to_string());
            output::print_detail("Completed", &report.completed.to_string());
            output::print_detail("Retried", &report.retried.to_string());
            output::print_detail("Failed", &report.failed.to_string());
        }
        _ => output::print_item(&report, format)?,
    }
    Ok(())
}

pub async fn status(args: StatusArgs, orchestrator: &UploadOrchestrator, format: OutputFormat) -> Result<()> {
    if let Some(batch_id) = args.batch_id {
        let jobs = orchestrator.store().list_by_batch(&batch_id).await?;
        if format == OutputFormat::Table {
            output::print_list(&jobs.iter().map(JobRow::from).collect::<Vec<_>>(), format)?;
        } else {
            output::print_item(&jobs, format)?;
        }
        return Ok(());
    }

    let snapshot = orchestrator.health_snapshot().await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Upload Queue");
            output::print_detail("Pending", &snapshot.stats.pending.to_string());
            output::print_detail("Processing", &snapshot.stats.processing.to_string());
            output::print_detail("Retry", &snapshot.stats.retry.to_string());
            output::print_detail("Completed", &snapshot.stats.completed.to_string());
            output::print_detail("Failed", &snapshot.stats.failed.to_string());
            output::print_detail("Queue depth", &snapshot.queue_depth.to_string());

            let ready = orchestrator.store().peek_ready(1).await?;
            if let Some(next) = ready.first() {
                output::print_detail("Next ready", &next.source_ref);
            }
        }
        _ => output::print_item(&snapshot, format)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("page_number=2").unwrap(),
            ("page_number".to_string(), "2".to_string())
        );
        assert_eq!(
            parse_key_val("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_metadata_values_keep_json_types() {
        let metadata = to_metadata(vec![
            ("page_number".into(), "2".into()),
            ("source".into(), "eu-portal".into()),
            ("partial".into(), "true".into()),
        ]);
        assert_eq!(metadata["page_number"], serde_json::json!(2));
        assert_eq!(metadata["source"], serde_json::json!("eu-portal"));
        assert_eq!(metadata["partial"], serde_json::json!(true));
    }
}
