//! Job store tests against SQLite.
//!
//! Tests cover:
//! - Claim ordering and exclusivity
//! - Readiness rules for retry times, terminal states and leases
//! - Statistics and batch listing
//! - Durability across a reopen of the same database file

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uploader_core::jobs::{JobMetadata, JobStore, SqliteJobStore, UploadStatus};

async fn store() -> SqliteJobStore {
    SqliteJobStore::in_memory().await.expect("in-memory store")
}

fn meta(page: u64) -> JobMetadata {
    let mut metadata = JobMetadata::new();
    metadata.insert("page_number".to_string(), json!(page));
    metadata
}

// ============================================================================
// Claiming
// ============================================================================

#[tokio::test]
async fn test_claim_returns_oldest_first() {
    let store = store().await;

    let mut ids = Vec::new();
    for page in 1..=5 {
        ids.push(
            store
                .enqueue(&format!("/data/page-{page}.json"), "batch-a", meta(page))
                .await
                .unwrap(),
        );
    }

    let first = store.claim_ready(3).await.unwrap();
    assert_eq!(first.iter().map(|j| j.id).collect::<Vec<_>>(), ids[..3].to_vec());
    assert!(first.iter().all(|j| j.status == UploadStatus::Processing));

    let second = store.claim_ready(10).await.unwrap();
    assert_eq!(second.iter().map(|j| j.id).collect::<Vec<_>>(), ids[3..].to_vec());

    assert!(store.claim_ready(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let store = store().await;
    for page in 0..20 {
        store.enqueue("/data/p.json", "batch-c", meta(page)).await.unwrap();
    }

    let (a, b, c) = tokio::join!(store.claim_ready(8), store.claim_ready(8), store.claim_ready(8));

    let mut seen = HashSet::new();
    for job in a.unwrap().into_iter().chain(b.unwrap()).chain(c.unwrap()) {
        assert!(seen.insert(job.id), "job {} claimed twice", job.id);
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn test_terminal_jobs_are_never_claimed() {
    let store = store().await;
    let done = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();
    let dead = store.enqueue("/data/b.json", "b", JobMetadata::new()).await.unwrap();

    store.claim_ready(10).await.unwrap();
    store.set_status(done, UploadStatus::Completed, None, None).await.unwrap();
    store
        .set_status(dead, UploadStatus::Failed, Some("gone"), None)
        .await
        .unwrap();

    assert!(store.claim_ready(10).await.unwrap().is_empty());
    assert_eq!(store.release_expired_leases().await.unwrap(), 0);
    assert!(store.claim_ready(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_waits_for_next_retry_at() {
    let store = store().await;
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();
    store.claim_ready(1).await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    store
        .set_status(id, UploadStatus::Retry, Some("[ServerError] Server error: 503"), Some(later))
        .await
        .unwrap();

    assert!(store.claim_ready(10).await.unwrap().is_empty());
    assert!(store.peek_ready(10).await.unwrap().is_empty());

    let earlier = Utc::now() - chrono::Duration::seconds(1);
    store
        .set_status(id, UploadStatus::Retry, Some("[ServerError] Server error: 503"), Some(earlier))
        .await
        .unwrap();

    let claimed = store.claim_ready(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(
        claimed[0].error_message.as_deref(),
        Some("[ServerError] Server error: 503")
    );
    assert_eq!(claimed[0].next_retry_at, None);

    let stored = store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, UploadStatus::Processing);
    assert_eq!(stored.next_retry_at, None);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let store = store().await.with_lease(Duration::ZERO);
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();

    let first = store.claim_ready(1).await.unwrap();
    assert_eq!(first[0].id, id);

    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = store.claim_ready(1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, id);
}

#[tokio::test]
async fn test_live_lease_blocks_reclaim() {
    let store = store().await.with_lease(Duration::from_secs(600));
    store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();

    assert_eq!(store.claim_ready(1).await.unwrap().len(), 1);
    assert!(store.claim_ready(1).await.unwrap().is_empty());
    assert_eq!(store.release_expired_leases().await.unwrap(), 0);
}

#[tokio::test]
async fn test_release_expired_leases() {
    let store = store().await.with_lease(Duration::ZERO);
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();
    store.claim_ready(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(store.release_expired_leases().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Pending);
    assert_eq!(job.next_retry_at, None);
}

#[tokio::test]
async fn test_reclaimed_retry_clears_next_retry_at() {
    let store = store().await.with_lease(Duration::ZERO);
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();
    store.claim_ready(1).await.unwrap();

    let earlier = Utc::now() - chrono::Duration::seconds(1);
    store
        .set_status(id, UploadStatus::Retry, Some("slow"), Some(earlier))
        .await
        .unwrap();
    store.claim_ready(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(store.release_expired_leases().await.unwrap(), 1);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Pending);
    assert_eq!(job.next_retry_at, None);
}

#[tokio::test]
async fn test_oversized_lease_still_claims() {
    let store = store()
        .await
        .with_lease(Duration::from_secs(10_000_000_000_000));
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();

    let claimed = store.claim_ready(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert!(store.claim_ready(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_peek_does_not_claim() {
    let store = store().await;
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();

    let peeked = store.peek_ready(5).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].status, UploadStatus::Pending);

    let claimed = store.claim_ready(5).await.unwrap();
    assert_eq!(claimed[0].id, id);
}

// ============================================================================
// Attempts
// ============================================================================

#[tokio::test]
async fn test_increment_attempts_returns_new_count() {
    let store = store().await.with_max_attempts(3);
    let id = store.enqueue("/data/a.json", "b", JobMetadata::new()).await.unwrap();

    assert_eq!(store.increment_attempts(id).await.unwrap(), 1);
    assert_eq!(store.increment_attempts(id).await.unwrap(), 2);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.max_attempts, 3);
    assert!(job.has_attempts_left());
}

// ============================================================================
// Stats and Listing
// ============================================================================

#[tokio::test]
async fn test_stats_and_queue_depth() {
    let store = store().await;
    let ids: Vec<_> = enqueue_many(&store, 5).await;

    store.claim_ready(3).await.unwrap();
    store.set_status(ids[0], UploadStatus::Completed, None, None).await.unwrap();
    store.set_status(ids[1], UploadStatus::Failed, Some("bad"), None).await.unwrap();
    store
        .set_status(ids[2], UploadStatus::Retry, Some("slow"), Some(Utc::now()))
        .await
        .unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.retry, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 5);

    assert_eq!(store.queue_depth().await.unwrap(), 3);
    assert_eq!(stats.depth(), 3);
}

async fn enqueue_many(store: &SqliteJobStore, n: u64) -> Vec<uploader_core::jobs::JobId> {
    let mut ids = Vec::new();
    for page in 0..n {
        ids.push(store.enqueue("/data/x.json", "stats", meta(page)).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn test_list_by_batch() {
    let store = store().await;
    store.enqueue("/data/1.json", "batch-1", meta(1)).await.unwrap();
    store.enqueue("/data/2.json", "batch-2", meta(1)).await.unwrap();
    store.enqueue("/data/3.json", "batch-1", meta(2)).await.unwrap();

    let jobs = store.list_by_batch("batch-1").await.unwrap();
    let refs: Vec<_> = jobs.iter().map(|j| j.source_ref.as_str()).collect();
    assert_eq!(refs, vec!["/data/1.json", "/data/3.json"]);
    assert_eq!(jobs[1].metadata_u64("page_number"), Some(2));

    assert!(store.list_by_batch("missing").await.unwrap().is_empty());
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());

    let (pending, retrying) = {
        let store = SqliteJobStore::connect(&url).await.unwrap();
        let pending = store.enqueue("/data/a.json", "b", meta(1)).await.unwrap();
        let retrying = store.enqueue("/data/b.json", "b", meta(2)).await.unwrap();

        store.claim_ready(10).await.unwrap();
        store.increment_attempts(retrying).await.unwrap();
        store
            .set_status(retrying, UploadStatus::Retry, Some("timeout"), Some(Utc::now()))
            .await
            .unwrap();
        store.set_status(pending, UploadStatus::Pending, None, None).await.unwrap();
        store.close().await;
        (pending, retrying)
    };

    let store = SqliteJobStore::connect(&url).await.unwrap();

    let job = store.get(retrying).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Retry);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message.as_deref(), Some("timeout"));
    assert_eq!(job.metadata_u64("page_number"), Some(2));

    let claimed = store.claim_ready(10).await.unwrap();
    let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![pending, retrying]);
}
