//! Uploader CLI - operate the TenderFlow upload queue.
//!
//! Provides commands to enqueue batch files, upload them immediately, drain
//! the queue, and inspect queue and endpoint health.

mod commands;
mod output;
mod pipeline;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{health, queue};
use output::OutputFormat;
use pipeline::Overrides;

/// Uploader - resilient delivery of scraped batches
#[derive(Parser)]
#[command(
    name = "uploader",
    version,
    about = "Uploader - resilient delivery of scraped batches",
    long_about = "Queue scraped batch files and deliver them to the ingestion endpoint with retries and a circuit breaker.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (environment variables override it)
    #[arg(short, long, global = true, env = "TENDERFLOW_CONFIG")]
    config: Option<String>,

    /// Ingestion API base URL
    #[arg(long, global = true, env = "TENDERFLOW_API_URL")]
    url: Option<String>,

    /// Bearer credential for the ingestion API
    #[arg(long, global = true, env = "TENDERFLOW_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Identifier reported as the scraper of each batch
    #[arg(long, global = true, env = "TENDERFLOW_SCRAPER_ID")]
    scraper_id: Option<String>,

    /// Upload queue database
    #[arg(long, global = true, env = "TENDERFLOW_DATABASE_URL")]
    database_url: Option<String>,

    /// Log filter for diagnostics on stderr
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a batch file for upload
    Enqueue(queue::EnqueueArgs),

    /// Queue a batch file and drain the queue right away
    Upload(queue::UploadArgs),

    /// Process every ready job once
    Drain,

    /// Show queue counters, or the jobs of one batch
    Status(queue::StatusArgs),

    /// Probe the ingestion endpoint and show breaker state
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let overrides = Overrides {
        config_file: cli.config.clone(),
        url: cli.url.clone(),
        api_key: cli.api_key.clone(),
        scraper_id: cli.scraper_id.clone(),
        database_url: cli.database_url.clone(),
        log_level: cli.log_level.clone(),
    };
    let format = cli.output;

    let result = run(cli.command, &overrides, format).await;

    if let Err(e) = result {
        output::print_error(&uploader_core::telemetry::redact(&format!("{:#}", e)));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, overrides: &Overrides, format: OutputFormat) -> Result<()> {
    let config = pipeline::load_config(overrides)?;
    pipeline::init_logging(&config, &overrides.log_level)?;
    let orchestrator = pipeline::connect(&config).await?;

    match command {
        Commands::Enqueue(args) => queue::enqueue(args, &orchestrator, format).await,
        Commands::Upload(args) => queue::upload(args, &orchestrator, format).await,
        Commands::Drain => queue::drain(&orchestrator, format).await,
        Commands::Status(args) => queue::status(args, &orchestrator, format).await,
        Commands::Health => health::execute(&orchestrator, &config, format).await,
    }
}
