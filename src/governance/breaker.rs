//! C7 — Circuit Breaker guarding reconciliation (spec.md §4.7).
//!
//! `closed -> open` after N consecutive failures, `open -> half-open`
//! after a cooldown, `half-open -> closed` on success or back to `open`
//! on any failure (no threshold recount). Validation-class errors never
//! count (spec.md §4.7, §9 "Circuit breaker false positives") — callers
//! pass `EngineError::is_client_fault()` through [`CircuitBreaker::on_result`].

use crate::error::EngineError;
use crate::time::Clock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            half_open_success_threshold: 1,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    half_open_inflight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_successes: 0,
            }),
            half_open_inflight: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(last_failure) = inner.last_failure_at {
                if self.clock.now().saturating_duration_since(last_failure) >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
    }

    /// `true` if a reconciliation probe may proceed right now; also claims
    /// one of the `half_open_max_calls` slots when half-open.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let retry_after = inner
                    .last_failure_at
                    .map(|t| self.config.recovery_timeout.saturating_sub(self.clock.now().saturating_duration_since(t)))
                    .unwrap_or(self.config.recovery_timeout);
                Err(EngineError::CircuitOpen { retry_after })
            }
            BreakerState::HalfOpen => {
                if self.half_open_inflight.load(Ordering::Acquire) >= self.config.half_open_max_calls {
                    return Err(EngineError::CircuitOpen {
                        retry_after: Duration::from_millis(100),
                    });
                }
                self.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    fn release_half_open_slot(&self) {
        self.half_open_inflight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
    }

    /// Records the outcome of a guarded call. `is_client_fault` errors are
    /// excluded from the failure counter entirely.
    pub fn on_result(&self, result: &Result<(), EngineError>) {
        let mut inner = self.inner.lock();
        let was_half_open = inner.state == BreakerState::HalfOpen;

        match result {
            Ok(()) => {
                match inner.state {
                    BreakerState::Closed => {
                        inner.consecutive_failures = 0;
                    }
                    BreakerState::HalfOpen => {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.half_open_success_threshold {
                            inner.state = BreakerState::Closed;
                            inner.consecutive_failures = 0;
                        }
                    }
                    BreakerState::Open => {}
                }
            }
            Err(error) if error.is_client_fault() => {
                // validation/cancellation errors never count as failures
            }
            Err(_) => match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    inner.last_failure_at = Some(self.clock.now());
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = BreakerState::Open;
                    }
                }
                BreakerState::HalfOpen => {
                    // one more failure in half-open reopens immediately, no threshold recount
                    inner.state = BreakerState::Open;
                    inner.last_failure_at = Some(self.clock.now());
                }
                BreakerState::Open => {
                    inner.last_failure_at = Some(self.clock.now());
                }
            },
        }

        if was_half_open {
            drop(inner);
            self.release_half_open_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockClock;

    #[test]
    fn opens_after_threshold_and_recovers() {
        let clock = Arc::new(MockClock::new());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());

        for _ in 0..3 {
            breaker.try_acquire().unwrap();
            breaker.on_result(&Err(EngineError::runtime("boom")));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());

        clock.advance(Duration::from_secs(31));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.try_acquire().unwrap();
        breaker.on_result(&Ok(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn validation_errors_never_count() {
        let clock = Arc::new(MockClock::new());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock);
        for _ in 0..10 {
            breaker.try_acquire().unwrap();
            breaker.on_result(&Err(EngineError::ValidationError {
                message: "bad args".to_string(),
            }));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
