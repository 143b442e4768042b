//! Upload job queue.
//!
//! - **Job model**: `UploadJob`, its lifecycle status and queue statistics
//! - **Store**: durable SQLite-backed queue with atomic, leased claims
//! - **Backoff**: retry delay curve with jitter and a cap
//! - **Worker**: periodic drain trigger with graceful shutdown
//!
//! # Lifecycle
//!
//! ```text
//!  enqueue          claim_ready                 accepted
//! ─────────▶ PENDING ──────────▶ PROCESSING ───────────────▶ COMPLETED
//!                                  │    ▲  │
//!                   transient error│    │  │ permanent error /
//!                    attempts left │    │  │ attempts exhausted
//!                                  ▼    │  ▼
//!                               RETRY ──┘  FAILED
//!                        (next_retry_at reached)
//! ```

pub mod backoff;
pub mod job;
pub mod store;
pub mod worker;

pub use backoff::{backoff, BackoffScheduler};
pub use job::{JobId, JobMetadata, QueueStats, UploadJob, UploadStatus};
pub use store::{JobStore, SqliteJobStore, DEFAULT_LEASE, DEFAULT_MAX_ATTEMPTS};
pub use worker::{DrainWorker, WorkerConfig, WorkerHandle, WorkerStats};
