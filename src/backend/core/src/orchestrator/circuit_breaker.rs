//! Circuit Breaker for the ingestion endpoint.
//!
//! Stops calling the remote side after too many consecutive failures and
//! lets a single trial call through once the recovery timeout has passed.
//!
//! ```text
//! CLOSED ──failures ≥ threshold──▶ OPEN ──recovery timeout──▶ HALF_OPEN
//!   ▲                                ▲                            │
//!   └──────────── success ───────────┼────────────────────────────┤
//!                                    └────────── failure ─────────┘
//! ```
//!
//! All state lives behind one mutex, so the check-then-act sequence of a
//! call is serialized and one breaker can be shared by several orchestrators.
//! The lock is never held while the guarded operation runs.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - requests blocked
    Open,
    /// Recovery timeout elapsed - one trial request allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Circuit breaker guarding calls to one remote dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,

    /// Failure threshold to trip the breaker
    failure_threshold: u32,

    /// How long to stay open before a trial call
    recovery_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5).with_recovery_timeout(Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Create with custom recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns `CircuitOpen` without invoking the operation while the circuit
    /// is open (or while a half-open trial is already running). Otherwise the
    /// operation's result is recorded and returned unchanged.
    pub async fn guard<F, Fut, T>(&self, operation: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut permit = self.admit()?;
        let result = operation().await;
        permit.resolve(result.is_ok());
        result
    }

    fn admit(&self) -> Result<Permit<'_>, PipelineError> {
        let mut inner = self.inner.lock();

        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    inner.total_rejections += 1;
                    return Err(PipelineError::circuit_open());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                tracing::info!("Circuit breaker transitioning to half-open");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    return Err(PipelineError::circuit_open());
                }
                true
            }
        };

        if trial {
            inner.trial_in_flight = true;
        }

        Ok(Permit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        inner.total_successes += 1;
        inner.failure_count = 0;

        if inner.state != CircuitState::Closed {
            self.transition(inner, CircuitState::Closed);
            tracing::info!("Circuit breaker closed after successful recovery");
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Open);
                counter!("circuit_breaker_trips_total").increment(1);
                tracing::warn!(
                    failures = inner.failure_count,
                    "Circuit breaker re-opened after failed recovery attempt"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                self.transition(inner, CircuitState::Open);
                counter!("circuit_breaker_trips_total").increment(1);
                tracing::warn!(
                    failures = inner.failure_count,
                    threshold = self.failure_threshold,
                    "Circuit breaker opened due to consecutive failures"
                );
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        inner.state = to;
        gauge!("circuit_breaker_state").set(to.gauge_value());
    }

    /// Get current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Get metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force reset the circuit breaker.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
        tracing::info!("Circuit breaker manually reset");
    }
}

/// Admission for one guarded call. Releases a half-open trial slot even if
/// the call's future is dropped before it resolves.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Permit<'_> {
    fn resolve(&mut self, success: bool) {
        let mut inner = self.breaker.inner.lock();
        if self.trial {
            inner.trial_in_flight = false;
        }
        if success {
            self.breaker.on_success(&mut inner);
        } else {
            self.breaker.on_failure(&mut inner);
        }
        self.resolved = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

/// Metrics for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub since_last_failure: Option<Duration>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    async fn fail(cb: &CircuitBreaker) -> Result<(), PipelineError> {
        cb.guard(|| async { Err::<(), _>(PipelineError::server_error(500)) }).await
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(3);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 2);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let cb = CircuitBreaker::new(3);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        let value = cb.guard(|| async { Ok::<_, PipelineError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_with_circuit_open() {
        let cb = CircuitBreaker::new(1).with_recovery_timeout(Duration::from_secs(3600));
        fail(&cb).await.unwrap_err();

        let err = cb
            .guard(|| async { Ok::<_, PipelineError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(cb.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let cb = CircuitBreaker::new(1).with_recovery_timeout(Duration::from_millis(1));
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(5)).await;

        {
            let pending = cb.guard(|| std::future::pending::<Result<(), PipelineError>>());
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.guard(|| async { Ok::<_, PipelineError>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
