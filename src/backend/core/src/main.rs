//! Upload worker - drains the upload queue on a fixed interval.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use uploader_core::{
    config::Config,
    jobs::{DrainWorker, WorkerConfig},
    orchestrator::UploadOrchestrator,
    telemetry::{self, LoggingConfig},
};

#[derive(Parser, Debug)]
#[command(name = "uploader-worker", version, about = "Drains the upload queue to the ingestion endpoint")]
struct Args {
    /// Configuration file (environment variables override it)
    #[arg(short, long, env = "TENDERFLOW_CONFIG")]
    config: Option<String>,

    /// Drain once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration
    let config = Config::resolve(args.config.as_deref())?;

    // Initialize logging
    let mut logging = LoggingConfig::from_observability(&config.observability);
    if let Some(key) = &config.ingestion.api_key {
        logging = logging.with_secret(key.clone());
    }
    telemetry::init_logging(&logging)?;

    if let Some(listen) = &config.observability.metrics_listen {
        let addr: SocketAddr = listen.parse()?;
        telemetry::init_metrics(addr)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.ingestion.base_url,
        "Starting upload worker"
    );

    let orchestrator = Arc::new(UploadOrchestrator::from_config(&config).await?);
    orchestrator.store().release_expired_leases().await?;

    if args.once {
        let report = orchestrator.drain().await?;
        tracing::info!(
            processed = report.processed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "Single drain finished"
        );
        return Ok(());
    }

    let worker = DrainWorker::new(
        WorkerConfig::default().with_poll_interval(config.drain.poll_interval()),
    );
    let handle = worker.start(orchestrator);

    shutdown_signal().await;

    handle.stop().await;
    tracing::info!("Upload worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
