//! Periodic drain worker with graceful shutdown.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::UploadOrchestrator;

/// Configuration for the drain worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Time between two drains (milliseconds)
    pub poll_interval_ms: u64,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            name: "upload-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Statistics for the drain worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Drains that finished
    pub drains: Arc<AtomicU64>,
    /// Jobs processed across all drains
    pub jobs_processed: Arc<AtomicU64>,
    /// Drains aborted by a store error
    pub drain_errors: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drains(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn drain_errors(&self) -> u64 {
        self.drain_errors.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down after the current drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the worker task to exit.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Drain worker task ended abnormally");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Calls `drain()` on a fixed interval until shut down.
pub struct DrainWorker {
    config: WorkerConfig,
    stats: WorkerStats,
}

impl DrainWorker {
    /// Create a new drain worker.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the worker, returning a handle for control.
    ///
    /// The first drain runs immediately. A failed drain is logged and the
    /// worker waits for the next tick.
    pub fn start(self, orchestrator: Arc<UploadOrchestrator>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config;

        let task = tokio::spawn(async move {
            let poll_interval = Duration::from_millis(config.poll_interval_ms);

            tracing::info!(
                worker = %config.name,
                poll_interval_ms = config.poll_interval_ms,
                "Drain worker started"
            );

            loop {
                match orchestrator.drain().await {
                    Ok(report) => {
                        stats.drains.fetch_add(1, Ordering::Relaxed);
                        stats.jobs_processed.fetch_add(report.processed, Ordering::Relaxed);
                        tracing::debug!(
                            worker = %config.name,
                            processed = report.processed,
                            "Drain finished"
                        );
                    }
                    Err(e) => {
                        stats.drain_errors.fetch_add(1, Ordering::Relaxed);
                        e.log();
                        tracing::error!(worker = %config.name, error = %e, "Drain aborted");
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!(worker = %config.name, "Worker shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            tracing::info!(worker = %config.name, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats: self.stats,
            task,
        }
    }
}
