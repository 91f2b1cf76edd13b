//! Circuit breaker around the classifier dependency.
//!
//! Closed → calls pass through, consecutive failures counted. At the
//! configured threshold the circuit opens and calls are rejected without
//! touching the dependency. After the recovery timeout the next admission
//! half-opens the circuit: a bounded number of probe calls may run
//! concurrently, any failure re-opens, and once all probes succeed the
//! circuit closes again.
//!
//! One breaker instance lives for the whole process; all state transitions
//! happen under a single mutex with short critical sections.

use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the dependency was not called.
    #[error("circuit open — dependency unavailable")]
    Open,
    /// The dependency was called and failed.
    #[error("dependency call failed")]
    Inner(#[source] E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_successes: u32,
    half_open_inflight: u32,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            recovery_timeout: cfg.recovery_timeout(),
            half_open_max_calls: cfg.half_open_max_calls,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_successes: 0,
                half_open_inflight: 0,
            }),
        }
    }

    /// Run `call` under breaker protection.
    pub async fn execute<T, E, F>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match call.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Current state, for the metrics endpoint.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let recovered = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_inflight = 1;
                    tracing::info!("circuit breaker half-open — probing dependency");
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_inflight < self.half_open_max_calls {
                    inner.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_max_calls {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    tracing::info!("circuit breaker closed — dependency recovered");
                }
            }
            // A success cannot be observed while open; admission rejects first.
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_failure_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure_at = Some(Instant::now());
                inner.half_open_inflight = 0;
                tracing::warn!("circuit breaker re-opened — probe failed");
            }
            BreakerState::Open => inner.last_failure_at = Some(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            half_open_max_calls: half_open,
        })
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b.execute::<(), _, _>(async { Err(std::io::Error::other("down")) }).await;
    }

    async fn succeed(b: &CircuitBreaker) -> bool {
        b.execute::<_, std::io::Error, _>(async { Ok(()) }).await.is_ok()
    }

    #[tokio::test]
    async fn closed_circuit_passes_calls_through() {
        let b = breaker(3, 30, 1);
        assert!(succeed(&b).await);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 30, 1);
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_dependency() {
        let b = breaker(1, 30, 1);
        fail(&b).await;

        let mut called = false;
        let result = b
            .execute::<(), std::io::Error, _>(async {
                called = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!called, "open circuit must not touch the dependency");
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let b = breaker(3, 30, 1);
        fail(&b).await;
        fail(&b).await;
        assert!(succeed(&b).await);
        // Two more failures do not reach the threshold of three.
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open_probe() {
        // Zero recovery timeout: the very next admission half-opens.
        let b = breaker(1, 0, 1);
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        assert!(succeed(&b).await);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(1, 0, 2);
        fail(&b).await;

        // First probe fails: straight back to open.
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_requires_all_probes_before_closing() {
        let b = breaker(1, 0, 2);
        fail(&b).await;

        assert!(succeed(&b).await);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(succeed(&b).await);
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
