//! Consecutive-failure circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! CLOSED    -> OPEN       (failure_threshold consecutive failures)
//! OPEN      -> HALF_OPEN  (open_timeout elapsed since the trip)
//! HALF_OPEN -> CLOSED     (the single trial call succeeds)
//! HALF_OPEN -> OPEN       (the trial fails; open_timeout restarts)
//! ```
//!
//! While OPEN the guarded operation is never invoked. In HALF_OPEN
//! exactly one trial is admitted; concurrent callers are rejected as if
//! the breaker were still open.
//!
//! Timing uses `tokio::time::Instant` so paused-clock tests can drive the
//! open timeout deterministically.

use crate::error::{CallError, CircuitOpenError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sentinel_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn metric_code(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is admitted.
    pub open_timeout: Duration,
    /// Upper bound on a single guarded call. A timeout counts as a failure.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            call_timeout: None,
        }
    }
}

/// Point-in-time view for health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Remaining cooldown while OPEN.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Circuit breaker for one operation family.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        Metrics::breaker_state(&name, BreakerState::Closed.metric_code());
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the OPEN -> HALF_OPEN transition if due.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure,
            retry_in: match inner.state {
                BreakerState::Open => Some(self.remaining(&inner)),
                _ => None,
            },
        }
    }

    /// Run `op` through the breaker. Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Run `op` through the breaker. Errors for which `is_failure` returns
    /// false (e.g. a business rejection from a healthy counterparty) are
    /// returned to the caller but recorded as successes.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        op: F,
        is_failure: C,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let mut permit = self.acquire()?;

        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r.map_err(CallError::Operation),
                Err(_) => Err(CallError::Timeout(limit)),
            },
            None => op().await.map_err(CallError::Operation),
        };

        let failed = match &result {
            Ok(_) => false,
            Err(CallError::Operation(e)) => is_failure(e),
            Err(_) => true,
        };
        if failed {
            permit.record_failure();
        } else {
            permit.record_success();
        }
        result
    }

    /// Operator reset to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.set_state(&mut inner, BreakerState::Closed);
        info!(breaker = %self.name, from = %previous, "Circuit breaker manually reset");
    }

    fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(Permit::new(self, false)),
            BreakerState::Open => {
                let retry_in = self.remaining(&inner);
                drop(inner);
                Err(self.rejection(retry_in))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    return Err(self.rejection(Duration::ZERO));
                }
                inner.trial_in_flight = true;
                debug!(breaker = %self.name, "Admitting half-open trial call");
                Ok(Permit::new(self, true))
            }
        }
    }

    fn rejection(&self, retry_in: Duration) -> CircuitOpenError {
        Metrics::breaker_rejected(&self.name);
        CircuitOpenError {
            breaker: self.name.clone(),
            retry_in,
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let due = inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.open_timeout)
                .unwrap_or(true);
            if due {
                inner.trial_in_flight = false;
                self.set_state(inner, BreakerState::HalfOpen);
                info!(breaker = %self.name, "Circuit breaker half-open, next call is a trial");
            }
        }
    }

    fn remaining(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|t| self.config.open_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.failure_count = 0;
                inner.opened_at = None;
                self.set_state(&mut inner, BreakerState::Closed);
                info!(breaker = %self.name, "Trial call succeeded, circuit breaker closed");
            }
        } else if inner.state == BreakerState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Utc::now());

        if trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                self.trip(&mut inner);
                warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
            }
            return;
        }

        if inner.state == BreakerState::Closed {
            inner.failure_count += 1;
            if inner.failure_count >= self.config.failure_threshold {
                self.trip(&mut inner);
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    open_timeout_ms = self.config.open_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
            debug!(breaker = %self.name, "Half-open trial abandoned before completion");
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.opened_at = Some(Instant::now());
        self.set_state(inner, BreakerState::Open);
    }

    fn set_state(&self, inner: &mut Inner, state: BreakerState) {
        inner.state = state;
        Metrics::breaker_state(&self.name, state.metric_code());
    }
}

/// Admission ticket for one guarded call. Dropping it without an outcome
/// (the caller's future was cancelled) frees a half-open trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn record_success(&mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn record_failure(&mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn breaker(threshold: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(open_secs),
                call_timeout: None,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CallError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_three_timeout_five() {
        let b = breaker(3, 5);
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(CallError::Operation("boom"))));
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(4)).await;
        let invoked = AtomicU32::new(0);
        let result = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 7);

        let snap = b.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_restarts_timeout() {
        let b = breaker(3, 5);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(succeed(&b).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_ok!(succeed(&b).await);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let b = Arc::new(breaker(1, 5));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let concurrent = succeed(&b).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let b = breaker(1, 5);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let hung = b.call(|| std::future::pending::<Result<(), &'static str>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), hung).await;

        assert_eq!(b.state(), BreakerState::HalfOpen);
        tokio_test::assert_ok!(succeed(&b).await);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(3, 5);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let b = CircuitBreaker::new(
            "slow",
            BreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(5),
                call_timeout: Some(Duration::from_millis(100)),
            },
        );
        let result = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_trip() {
        let b = breaker(1, 5);
        let result = b
            .call_classified(|| async { Err::<(), _>("rejected") }, |_| false)
            .await;
        assert!(matches!(result, Err(CallError::Operation("rejected"))));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let b = breaker(1, 60);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.snapshot().retry_in.is_some());
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        tokio_test::assert_ok!(succeed(&b).await);
    }
}
