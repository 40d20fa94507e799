//! Three-state circuit breaker guarding remote dependencies.
//!
//! closed -> open after `failure_threshold` consecutive failures;
//! open -> half_open after `timeout`; half_open admits a bounded number of
//! probes and closes again after `success_threshold` probe successes.

use std::future::Future;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::exchange::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_calls: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    /// Admission must be obtained before the remote call; open circuits
    /// reject immediately with `ExchangeError::CircuitOpen`.
    pub fn try_admit(&self) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 1;
                    inner.successes = 0;
                    log::info!("breaker.{} open -> half_open", self.name);
                    Ok(())
                } else {
                    Err(ExchangeError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(ExchangeError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    log::info!("breaker.{} half_open -> closed", self.name);
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                inner.half_open_calls = 0;
                inner.trips += 1;
                log::warn!("breaker.{} half_open -> open (probe failed)", self.name);
            }
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trips += 1;
                    log::warn!(
                        "breaker.{} closed -> open (failures={})",
                        self.name,
                        inner.failures
                    );
                }
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Runs one remote call under the breaker: admission first, then
    /// success/failure reported from the result.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        self.try_admit()?;
        match fut.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                timeout,
                half_open_max_calls: 3,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_threshold_then_recovers() {
        let b = breaker(3, Duration::from_secs(1));

        // Three consecutive failures trip the breaker.
        for _ in 0..3 {
            assert!(b.try_admit().is_ok());
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 1);

        // Open rejects without touching the remote.
        assert!(matches!(b.try_admit(), Err(ExchangeError::CircuitOpen)));

        // After the timeout the next call is admitted as a half-open probe.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(b.try_admit().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // One success of two keeps it half-open; the second closes it.
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_admit().is_ok());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_secs(1));
        b.try_admit().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        b.try_admit().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_bounds_concurrent_probes() {
        let b = breaker(1, Duration::from_secs(1));
        b.try_admit().unwrap();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        // First admit flips to half-open and counts as probe #1.
        assert!(b.try_admit().is_ok());
        assert!(b.try_admit().is_ok());
        assert!(b.try_admit().is_ok());
        assert!(matches!(b.try_admit(), Err(ExchangeError::CircuitOpen)));
    }

    #[tokio::test]
    async fn closed_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_wraps_admission_and_reporting() {
        let b = breaker(1, Duration::from_secs(60));
        let err: Result<(), _> = b
            .call(async { Err(ExchangeError::Transient("boom".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        // While open, the guarded future must never run.
        let out: Result<(), _> = b.call(async { panic!("must not run") }).await;
        assert!(matches!(out, Err(ExchangeError::CircuitOpen)));
    }
}
