//! Circuit Breaker state transition tests.
//!
//! Tests cover:
//! - Opening after exactly `threshold` consecutive failures
//! - Refusing calls without invoking them while open
//! - Half-open trial after the recovery timeout
//! - A single trial in flight under concurrency
//! - Metrics and manual reset

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uploader_core::error::{ErrorCode, PipelineError};
use uploader_core::orchestrator::{CircuitBreaker, CircuitState};

async fn failing_call(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), PipelineError> {
    breaker
        .guard(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::server_error(503))
        })
        .await
}

async fn succeeding_call(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), PipelineError> {
    breaker
        .guard(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_circuit_breaker_creation_default_state() {
    let breaker = CircuitBreaker::default();

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.failure_threshold(), 5);
    assert_eq!(breaker.recovery_timeout(), Duration::from_secs(60));
}

#[test]
fn test_zero_threshold_is_clamped() {
    let breaker = CircuitBreaker::new(0);
    assert_eq!(breaker.failure_threshold(), 1);
}

// ============================================================================
// Opening
// ============================================================================

#[tokio::test]
async fn test_opens_after_exactly_threshold_failures() {
    for threshold in [1u32, 3, 5] {
        let breaker = CircuitBreaker::new(threshold).with_recovery_timeout(Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for i in 1..threshold {
            failing_call(&breaker, &calls).await.unwrap_err();
            assert_eq!(breaker.state(), CircuitState::Closed, "opened early at failure {i}");
        }

        failing_call(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), threshold);
    }
}

#[tokio::test]
async fn test_open_circuit_does_not_invoke_operation() {
    let breaker = CircuitBreaker::new(2).with_recovery_timeout(Duration::from_secs(60));
    let calls = AtomicU32::new(0);

    failing_call(&breaker, &calls).await.unwrap_err();
    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = succeeding_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_interleaved_success_prevents_opening() {
    let breaker = CircuitBreaker::new(3);
    let calls = AtomicU32::new(0);

    for _ in 0..5 {
        failing_call(&breaker, &calls).await.unwrap_err();
        failing_call(&breaker, &calls).await.unwrap_err();
        succeeding_call(&breaker, &calls).await.unwrap();
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_half_open_success_closes() {
    let breaker = CircuitBreaker::new(1).with_recovery_timeout(Duration::from_millis(20));
    let calls = AtomicU32::new(0);

    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;

    succeeding_call(&breaker, &calls).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreaker::new(2).with_recovery_timeout(Duration::from_millis(20));
    let calls = AtomicU32::new(0);

    failing_call(&breaker, &calls).await.unwrap_err();
    failing_call(&breaker, &calls).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let err = failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerError);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.failure_count() >= 2);

    // The re-open restarts the recovery timer.
    let err = succeeding_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_single_trial_in_half_open() {
    let breaker = Arc::new(CircuitBreaker::new(1).with_recovery_timeout(Duration::from_millis(10)));
    let calls = Arc::new(AtomicU32::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let trial = {
        let breaker = breaker.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            breaker
                .guard(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.await;
                    Ok::<_, PipelineError>(())
                })
                .await
        })
    };

    // Let the trial enter the operation.
    while calls.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let err = succeeding_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    release_tx.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ============================================================================
// Metrics and Reset
// ============================================================================

#[tokio::test]
async fn test_metrics_track_outcomes() {
    let breaker = CircuitBreaker::new(2).with_recovery_timeout(Duration::from_secs(60));
    let calls = AtomicU32::new(0);

    succeeding_call(&breaker, &calls).await.unwrap();
    failing_call(&breaker, &calls).await.unwrap_err();
    failing_call(&breaker, &calls).await.unwrap_err();
    succeeding_call(&breaker, &calls).await.unwrap_err();

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.failure_count, 2);
    assert_eq!(metrics.failure_threshold, 2);
    assert_eq!(metrics.total_successes, 1);
    assert_eq!(metrics.total_failures, 2);
    assert_eq!(metrics.total_rejections, 1);
    assert!(metrics.since_last_failure.is_some());
}

#[tokio::test]
async fn test_reset_closes_circuit() {
    let breaker = CircuitBreaker::new(1).with_recovery_timeout(Duration::from_secs(60));
    let calls = AtomicU32::new(0);

    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    succeeding_call(&breaker, &calls).await.unwrap();
}

#[test]
fn test_state_display() {
    assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
    assert_eq!(CircuitState::Open.to_string(), "OPEN");
    assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
}
