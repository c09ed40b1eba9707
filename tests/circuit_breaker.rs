//! P7: the breaker denies exactly when open and the cooldown hasn't
//! elapsed, and half-open only ever admits `half_open_max_calls` probes
//! concurrently.

use engine_core::governance::{BreakerConfig, BreakerState, CircuitBreaker};
use engine_core::time::MockClock;
use engine_core::EngineError;
use std::sync::Arc;
use std::time::Duration;

fn config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(10),
        half_open_max_calls: 1,
        half_open_success_threshold: 1,
    }
}

#[test]
fn denies_while_open_and_admits_after_cooldown() {
    let clock = Arc::new(MockClock::new());
    let breaker = CircuitBreaker::new(config(), clock.clone());

    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));
    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));

    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(breaker.try_acquire().is_err());

    clock.advance(Duration::from_secs(5));
    assert!(breaker.try_acquire().is_err(), "cooldown has not elapsed yet");

    clock.advance(Duration::from_secs(6));
    assert!(breaker.try_acquire().is_ok(), "cooldown elapsed, half-open probe allowed");
}

#[test]
fn half_open_admits_only_configured_concurrent_probes() {
    let clock = Arc::new(MockClock::new());
    let breaker = CircuitBreaker::new(config(), clock.clone());

    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));
    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));
    clock.advance(Duration::from_secs(11));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    assert!(breaker.try_acquire().is_ok(), "first half-open probe admitted");
    assert!(breaker.try_acquire().is_err(), "second concurrent probe must be denied");

    breaker.on_result(&Ok(()));
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn half_open_failure_reopens_without_threshold_recount() {
    let clock = Arc::new(MockClock::new());
    let breaker = CircuitBreaker::new(config(), clock.clone());

    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));
    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("boom")));
    clock.advance(Duration::from_secs(11));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.try_acquire().unwrap();
    breaker.on_result(&Err(EngineError::runtime("still broken")));
    assert_eq!(breaker.state(), BreakerState::Open);
}
