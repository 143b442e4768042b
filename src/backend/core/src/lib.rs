#![allow(clippy::result_large_err)]
//! # Uploader Core
//!
//! Resilient delivery of locally produced data batches to a remote
//! ingestion endpoint.
//!
//! ## Architecture
//!
//! - **Job Store**: durable SQLite queue of upload jobs with atomic, leased claims
//! - **Circuit Breaker**: process-wide health gate for the ingestion endpoint
//! - **Backoff**: exponential retry delays with jitter and a cap
//! - **Transport**: one HTTP call per attempt and response classification
//! - **Orchestrator**: drain loop that claims, delivers and records outcomes
//! - **Telemetry**: structured logging with credential redaction, Prometheus metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod payload;
pub mod telemetry;
pub mod transport;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, PipelineError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, PipelineError, Result};
    pub use crate::jobs::{
        backoff, BackoffScheduler, DrainWorker, JobId, JobMetadata, JobStore, QueueStats,
        SqliteJobStore, UploadJob, UploadStatus, WorkerConfig,
    };
    pub use crate::orchestrator::{
        CircuitBreaker, CircuitState, DrainReport, HealthSnapshot, JobOutcome,
        OrchestratorConfig, UploadOrchestrator, UploadReport,
    };
    pub use crate::payload::{FsPayloadSource, PayloadSource};
    pub use crate::transport::{Delivery, Envelope, EnvelopeBuilder, HttpTransport, UploadTransport};
}
