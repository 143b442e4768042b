//! Upload Orchestrator - the drain loop of the pipeline.
//!
//! Claims ready jobs, loads their payloads, delivers them through the circuit
//! breaker with a bounded in-process retry loop and records the outcome in
//! the job store.
//!
//! Delivery is at-least-once: a crash between a successful request and the
//! `COMPLETED` write redelivers the batch once the claim lease expires.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::jobs::{
    BackoffScheduler, JobId, JobMetadata, JobStore, QueueStats, SqliteJobStore, UploadJob,
    UploadStatus,
};
use crate::payload::{FsPayloadSource, PayloadSource};
use crate::telemetry::{redact, UploadMetrics};
use crate::transport::{Delivery, Envelope, EnvelopeBuilder, HttpTransport, UploadTransport};

/// Configuration for the UploadOrchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Jobs claimed per store round trip
    pub batch_size: u32,

    /// Pause between two jobs of one drain
    pub job_delay: Duration,

    /// Retry delay curve
    pub backoff: BackoffScheduler,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            job_delay: Duration::from_secs(1),
            backoff: BackoffScheduler::default(),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.queue.batch_size,
            job_delay: config.drain.job_delay(),
            backoff: BackoffScheduler::default().with_unit(config.drain.backoff_unit()),
        }
    }
}

/// What one processing cycle did to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Retry { next_retry_at: DateTime<Utc> },
    Failed { error: String },
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retry { .. } => "retry",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Totals for one `drain()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
}

impl DrainReport {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retry { .. } => self.retried += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Result of `upload()`: the new job and the drain that processed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    pub job_id: JobId,
    pub batch_id: String,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub drain: DrainReport,
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub breaker_state: CircuitState,
    pub failure_count: u32,
    pub queue_depth: u64,
    pub stats: QueueStats,
    pub timestamp: DateTime<Utc>,
}

/// The upload orchestrator.
pub struct UploadOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn UploadTransport>,
    source: Arc<dyn PayloadSource>,
    envelopes: EnvelopeBuilder,
}

impl UploadOrchestrator {
    /// Create an orchestrator reading payloads from the filesystem.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn UploadTransport>,
    ) -> Self {
        Self {
            config,
            store,
            breaker,
            transport,
            source: Arc::new(FsPayloadSource::new()),
            envelopes: EnvelopeBuilder::default(),
        }
    }

    /// Wire everything up from the uploader configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = SqliteJobStore::connect(&config.queue.database_url)
            .await?
            .with_max_attempts(config.queue.max_attempts)
            .with_lease(config.queue.lease());

        let breaker = CircuitBreaker::new(config.breaker.failure_threshold)
            .with_recovery_timeout(config.breaker.recovery_timeout());

        let transport = HttpTransport::new(&config.ingestion)?;

        let envelopes = EnvelopeBuilder::new(config.ingestion.scraper_id.clone())
            .with_records_field(config.ingestion.records_field.clone());

        Ok(Self::new(
            OrchestratorConfig::from(config),
            Arc::new(store),
            Arc::new(breaker),
            Arc::new(transport),
        )
        .with_envelope_builder(envelopes))
    }

    pub fn with_source(mut self, source: Arc<dyn PayloadSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_envelope_builder(mut self, envelopes: EnvelopeBuilder) -> Self {
        self.envelopes = envelopes;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producer API
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a new upload job.
    pub async fn enqueue(&self, source_ref: &str, batch_id: &str, metadata: JobMetadata) -> Result<JobId> {
        let id = self.store.enqueue(source_ref, batch_id, metadata).await?;
        info!(job_id = %id, batch_id = %batch_id, source_ref = %source_ref, "Upload job queued");
        Ok(id)
    }

    /// Enqueue one file and drain the queue right away.
    ///
    /// A batch id is generated when none is given.
    pub async fn upload(
        &self,
        source_ref: &str,
        batch_id: Option<&str>,
        metadata: JobMetadata,
    ) -> Result<UploadReport> {
        let batch_id = batch_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let job_id = self.enqueue(source_ref, &batch_id, metadata).await?;
        let drain = self.drain().await?;

        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;

        Ok(UploadReport {
            job_id,
            batch_id,
            status: job.status,
            error_message: job.error_message,
            drain,
        })
    }

    /// Process ready jobs until none are left.
    ///
    /// A store error aborts the drain; every other failure is recorded on its
    /// job.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let jobs = self.store.claim_ready(self.config.batch_size).await?;
            if jobs.is_empty() {
                break;
            }

            for job in jobs {
                if report.processed > 0 && !self.config.job_delay.is_zero() {
                    tokio::time::sleep(self.config.job_delay).await;
                }
                let outcome = self.process_job(&job).await?;
                report.record(&outcome);
            }
        }

        UploadMetrics::set_queue_depth(self.store.queue_depth().await?);

        if report.processed > 0 {
            info!(
                processed = report.processed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "Upload queue drained"
            );
        }
        Ok(report)
    }

    /// Breaker state and queue counters.
    pub async fn health_snapshot(&self) -> Result<HealthSnapshot> {
        let stats = self.store.stats().await?;
        let metrics = self.breaker.metrics();

        Ok(HealthSnapshot {
            breaker_state: metrics.state,
            failure_count: metrics.failure_count,
            queue_depth: stats.depth(),
            stats,
            timestamp: Utc::now(),
        })
    }

    /// Out-of-band probe of the ingestion endpoint. Does not touch the breaker.
    pub async fn endpoint_healthy(&self) -> bool {
        self.transport.health().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processing Cycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one processing cycle for a claimed job.
    ///
    /// Returns `Err` only for store failures.
    pub async fn process_job(&self, job: &UploadJob) -> Result<JobOutcome> {
        let span = info_span!("upload_job", job_id = %job.id, batch_id = %job.batch_id);
        let outcome = self.run_cycle(job).instrument(span).await?;
        UploadMetrics::record_outcome(outcome.label());
        Ok(outcome)
    }

    async fn run_cycle(&self, job: &UploadJob) -> Result<JobOutcome> {
        match self.source.exists(&job.source_ref).await {
            Ok(true) => {}
            Ok(false) => {
                let err = PipelineError::source_not_found(&job.source_ref);
                return self.fail(job, &err).await;
            }
            Err(err) => return self.fail(job, &err).await,
        }

        let envelope = match self.load_envelope(job).await {
            Ok(envelope) => envelope,
            Err(err) => return self.fail(job, &err).await,
        };

        // A worker that died mid-cycle may leave a job with no attempts left.
        if !job.has_attempts_left() {
            let err = PipelineError::max_attempts_exceeded(job.attempts, job.error_message.as_deref());
            return self.fail(job, &err).await;
        }

        let attempts = self.store.increment_attempts(job.id).await?;
        let budget = if attempts <= 1 {
            job.max_attempts.saturating_sub(attempts).max(1)
        } else {
            job.max_attempts.saturating_sub(attempts)
        };

        debug!(attempts, budget, "Starting delivery");

        let mut last_error: Option<PipelineError> = None;
        for sub_attempt in 0..budget {
            if sub_attempt > 0 {
                tokio::time::sleep(self.config.backoff.delay(sub_attempt - 1)).await;
            }

            match self.breaker.guard(|| self.transport.send(&envelope)).await {
                Ok(Delivery::Accepted) => return self.complete(job).await,
                Ok(Delivery::Rejected(reason)) => {
                    let err = PipelineError::client_rejected(reason);
                    return self.fail(job, &err).await;
                }
                Err(err) if !err.is_retryable() => return self.fail(job, &err).await,
                Err(err) => {
                    // Long waits go back to the store instead of blocking the worker.
                    let stop = err.code() == ErrorCode::CircuitOpen || err.retry_after().is_some();
                    warn!(
                        attempts,
                        sub_attempt,
                        error_code = %err.code(),
                        error = %redact(err.message()),
                        "Delivery attempt failed"
                    );
                    last_error = Some(err);
                    if stop {
                        break;
                    }
                }
            }
        }

        let Some(err) = last_error else {
            let err = PipelineError::max_attempts_exceeded(attempts, job.error_message.as_deref());
            return self.fail(job, &err).await;
        };

        if attempts < job.max_attempts {
            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.config.backoff.delay(attempts));
            self.retry(job, &err, delay, attempts).await
        } else {
            let wrapped = PipelineError::max_attempts_exceeded(attempts, Some(&err.to_string()));
            self.fail(job, &wrapped).await
        }
    }

    async fn load_envelope(&self, job: &UploadJob) -> Result<Envelope> {
        let bytes = self.source.load(&job.source_ref).await?;
        self.envelopes.build(job, &bytes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outcome Recording
    // ─────────────────────────────────────────────────────────────────────────

    async fn complete(&self, job: &UploadJob) -> Result<JobOutcome> {
        self.store
            .set_status(job.id, UploadStatus::Completed, None, None)
            .await?;
        info!(source_ref = %job.source_ref, "Batch uploaded");
        Ok(JobOutcome::Completed)
    }

    async fn retry(
        &self,
        job: &UploadJob,
        err: &PipelineError,
        delay: Duration,
        attempts: u32,
    ) -> Result<JobOutcome> {
        let message = redact(&err.to_string());
        let now = Utc::now();
        let next_retry_at = offset(now, delay)
            .or_else(|| offset(now, self.config.backoff.delay(attempts)))
            .unwrap_or(now);

        self.store
            .set_status(job.id, UploadStatus::Retry, Some(&message), Some(next_retry_at))
            .await?;

        info!(
            next_retry_at = %next_retry_at,
            delay_ms = delay.as_millis() as u64,
            "Upload scheduled for retry"
        );
        Ok(JobOutcome::Retry { next_retry_at })
    }

    async fn fail(&self, job: &UploadJob, err: &PipelineError) -> Result<JobOutcome> {
        let message = redact(&err.to_string());
        self.store
            .set_status(job.id, UploadStatus::Failed, Some(&message), None)
            .await?;

        err.log();
        warn!(error = %message, "Upload failed permanently");
        Ok(JobOutcome::Failed { error: message })
    }
}

/// `now + delay`, or `None` when it does not fit a timestamp.
fn offset(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}
