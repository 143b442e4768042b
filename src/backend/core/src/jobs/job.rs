//! Upload job model.
//!
//! - **JobId**: UUID newtype identifying one upload job
//! - **UploadStatus**: lifecycle states persisted in the `status` column
//! - **UploadJob**: one row of the `upload_jobs` table
//! - **QueueStats**: per-status counts used for status reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorCode, PipelineError};

/// Producer metadata attached to a job. Opaque to the pipeline apart from the
/// optional `page_number` / `total_pages` keys.
pub type JobMetadata = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PipelineError::new(ErrorCode::JobNotFound, format!("invalid job id '{}': {}", s, e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upload Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Enqueued, never claimed
    Pending,
    /// Claimed by a worker, lease running
    Processing,
    /// Waiting for `next_retry_at`
    Retry,
    /// Accepted by the ingestion endpoint
    Completed,
    /// Permanently failed
    Failed,
}

impl UploadStatus {
    pub const ALL: [UploadStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Retry,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retry" => Ok(Self::Retry),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::with_internal(
                ErrorCode::StoreError,
                "Unknown job status in store",
                format!("status column holds '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upload Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One durable upload job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: JobId,
    /// Where the payload lives (a file path for the filesystem source)
    pub source_ref: String,
    /// Producer-supplied grouping key, not unique
    pub batch_id: String,
    pub status: UploadStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Set only while `status` is `Retry`
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: JobMetadata,
}

impl UploadJob {
    /// Whether another processing cycle is allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Look up an integer metadata key, accepting numeric strings too.
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        match self.metadata.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Record `count` jobs in `status`.
    pub fn add(&mut self, status: UploadStatus, count: u64) {
        match status {
            UploadStatus::Pending => self.pending += count,
            UploadStatus::Processing => self.processing += count,
            UploadStatus::Retry => self.retry += count,
            UploadStatus::Completed => self.completed += count,
            UploadStatus::Failed => self.failed += count,
        }
    }

    /// Jobs not yet in a terminal state.
    pub fn depth(&self) -> u64 {
        self.pending + self.processing + self.retry
    }

    pub fn total(&self) -> u64 {
        self.depth() + self.completed + self.failed
    }
}
