//! Durable job store.
//!
//! [`JobStore`] is the persistence seam of the pipeline; [`SqliteJobStore`]
//! implements it over a single SQLite file (or an in-memory database for
//! tests). Every mutation is one SQL statement, so a crash between calls
//! leaves each row in its last committed state.
//!
//! Claiming is atomic: selection and the move to `processing` happen in one
//! `UPDATE ... RETURNING`, and the claimed rows carry a lease. A worker that
//! dies mid-cycle leaves its jobs in `processing` until the lease runs out,
//! after which they become claimable again.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::job::{JobId, JobMetadata, QueueStats, UploadJob, UploadStatus};
use crate::error::{PipelineError, Result};

/// Default attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default claim lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence contract for upload jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `pending` job and return its id.
    async fn enqueue(&self, source_ref: &str, batch_id: &str, metadata: JobMetadata) -> Result<JobId>;

    /// Atomically claim up to `limit` ready jobs, oldest first.
    ///
    /// Ready means `pending`/`retry` with no `next_retry_at` in the future, or
    /// `processing` with an expired lease.
    async fn claim_ready(&self, limit: u32) -> Result<Vec<UploadJob>>;

    /// Ready jobs without claiming them.
    async fn peek_ready(&self, limit: u32) -> Result<Vec<UploadJob>>;

    /// Overwrite status, error message and retry time in one write.
    async fn set_status(
        &self,
        job_id: JobId,
        status: UploadStatus,
        error_message: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Add one attempt and return the new count.
    async fn increment_attempts(&self, job_id: JobId) -> Result<u32>;

    async fn get(&self, job_id: JobId) -> Result<Option<UploadJob>>;

    async fn list_by_batch(&self, batch_id: &str) -> Result<Vec<UploadJob>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Number of jobs that are not yet terminal.
    async fn queue_depth(&self) -> Result<u64>;

    /// Put `processing` jobs whose lease ran out back to `pending`.
    async fn release_expired_leases(&self) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Mapping
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct UploadJobRow {
    seq: i64,
    id: String,
    source_ref: String,
    batch_id: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    next_retry_at: Option<i64>,
    error_message: Option<String>,
    metadata: String,
}

const JOB_COLUMNS: &str = "seq, id, source_ref, batch_id, status, attempts, max_attempts, \
                           created_at, next_retry_at, error_message, metadata";

impl TryFrom<UploadJobRow> for UploadJob {
    type Error = PipelineError;

    fn try_from(row: UploadJobRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id).map_err(|e| {
            PipelineError::with_internal(
                crate::error::ErrorCode::StoreError,
                "Corrupt job id in store",
                format!("row {}: {}", row.seq, e),
            )
        })?;

        Ok(Self {
            id: JobId(id),
            source_ref: row.source_ref,
            batch_id: row.batch_id,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(DEFAULT_MAX_ATTEMPTS),
            created_at: from_millis(row.created_at)?,
            next_retry_at: row.next_retry_at.map(from_millis).transpose()?,
            error_message: row.error_message,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        PipelineError::with_internal(
            crate::error::ErrorCode::StoreError,
            "Corrupt timestamp in store",
            format!("{} ms is out of range", ms),
        )
    })
}

fn into_jobs(rows: Vec<UploadJobRow>) -> Result<Vec<UploadJob>> {
    rows.into_iter().map(UploadJob::try_from).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite Implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    max_attempts: u32,
    lease: Duration,
}

impl SqliteJobStore {
    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease: DEFAULT_LEASE,
        }
    }

    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!(url = %url, "Job store ready");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to `:memory:` is its own database, so the pool must
        // hold exactly one connection for its whole life.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Attempts granted to newly enqueued jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Visibility timeout for claimed jobs.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(600))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    async fn enqueue(&self, source_ref: &str, batch_id: &str, metadata: JobMetadata) -> Result<JobId> {
        let id = JobId::new();
        let metadata = serde_json::to_string(&metadata)?;

        sqlx::query(
            r#"
            INSERT INTO upload_jobs (id, source_ref, batch_id, status, attempts, max_attempts, created_at, metadata)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6)
            "#,
        )
        .bind(id.to_string())
        .bind(source_ref)
        .bind(batch_id)
        .bind(self.max_attempts as i64)
        .bind(to_millis(Utc::now()))
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, source_ref = %source_ref, "Upload job enqueued");
        Ok(id)
    }

    async fn claim_ready(&self, limit: u32) -> Result<Vec<UploadJob>> {
        let now = Utc::now();
        let lease_expires_at = now
            .checked_add_signed(self.lease_chrono())
            .unwrap_or_else(|| now + chrono::Duration::seconds(600));

        let sql = format!(
            r#"
            UPDATE upload_jobs
            SET status = 'processing', lease_expires_at = ?1, next_retry_at = NULL
            WHERE id IN (
                SELECT id FROM upload_jobs
                WHERE (status IN ('pending', 'retry') AND (next_retry_at IS NULL OR next_retry_at <= ?2))
                   OR (status = 'processing' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?2)
                ORDER BY created_at ASC, seq ASC
                LIMIT ?3
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let mut rows: Vec<UploadJobRow> = sqlx::query_as(&sql)
            .bind(to_millis(lease_expires_at))
            .bind(to_millis(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        rows.sort_by_key(|row| (row.created_at, row.seq));

        if !rows.is_empty() {
            debug!(claimed = rows.len(), "Claimed ready upload jobs");
        }
        into_jobs(rows)
    }

    async fn peek_ready(&self, limit: u32) -> Result<Vec<UploadJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM upload_jobs
            WHERE status IN ('pending', 'retry') AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY created_at ASC, seq ASC
            LIMIT ?2
            "#,
            JOB_COLUMNS
        );

        let rows: Vec<UploadJobRow> = sqlx::query_as(&sql)
            .bind(to_millis(Utc::now()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    #[instrument(skip_all, fields(job_id = %job_id, status = %status))]
    async fn set_status(
        &self,
        job_id: JobId,
        status: UploadStatus,
        error_message: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET status = ?1, error_message = ?2, next_retry_at = ?3, lease_expires_at = NULL
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(next_retry_at.map(to_millis))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::job_not_found(job_id));
        }
        Ok(())
    }

    async fn increment_attempts(&self, job_id: JobId) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE upload_jobs SET attempts = attempts + 1 WHERE id = ?1 RETURNING attempts",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(n) => Ok(u32::try_from(n).unwrap_or(u32::MAX)),
            None => Err(PipelineError::job_not_found(job_id)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<UploadJob>> {
        let sql = format!("SELECT {} FROM upload_jobs WHERE id = ?1", JOB_COLUMNS);
        let row: Option<UploadJobRow> = sqlx::query_as(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(UploadJob::try_from).transpose()
    }

    async fn list_by_batch(&self, batch_id: &str) -> Result<Vec<UploadJob>> {
        let sql = format!(
            "SELECT {} FROM upload_jobs WHERE batch_id = ?1 ORDER BY created_at ASC, seq ASC",
            JOB_COLUMNS
        );
        let rows: Vec<UploadJobRow> = sqlx::query_as(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM upload_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status.parse()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_jobs WHERE status IN ('pending', 'retry', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(depth.max(0) as u64)
    }

    async fn release_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET status = 'pending', lease_expires_at = NULL, next_retry_at = NULL
            WHERE status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
            "#,
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "Released upload jobs with expired leases");
        }
        Ok(released)
    }
}
