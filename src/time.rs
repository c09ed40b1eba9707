//! Injectable clock, grounded on the teacher crate's `time::clock::Clock`
//! trait: every timeout, PID sample tick, and backoff delay is computed
//! against a `Clock` rather than calling `Instant::now()`/`tokio::time`
//! directly, so the governor, breaker and supervisor can be driven with a
//! [`MockClock`] in tests instead of real wall-clock sleeps.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Sleep;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests: `now()` starts at an arbitrary epoch and
/// only advances when the test explicitly calls [`MockClock::advance`];
/// `sleep` resolves as soon as the requested deadline has been crossed by
/// an `advance` call.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<MockClockInner>,
}

struct MockClockInner {
    base: Instant,
    elapsed_nanos: AtomicU64,
    notify: tokio::sync::Notify,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockClockInner {
                base: Instant::now(),
                elapsed_nanos: AtomicU64::new(0),
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.inner
            .elapsed_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.inner.elapsed_nanos.load(Ordering::SeqCst))
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.inner.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let inner = self.inner.clone();
        let deadline = self.elapsed() + duration;
        Box::pin(async move {
            loop {
                let current = Duration::from_nanos(inner.elapsed_nanos.load(Ordering::SeqCst));
                if current >= deadline {
                    return;
                }
                inner.notify.notified().await;
            }
        })
    }
}

/// Deterministic pseudo-random jitter, grounded verbatim on the teacher
/// crate's `governance::retry::adaptive` SplitMix64 jitter: used to avoid
/// synchronized retries/cooldowns across many callers while keeping
/// jittered delays reproducible under a fixed seed for tests.
pub fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Maps a splitmix64 output to a multiplicative jitter factor in
/// `[1.0 - spread, 1.0 + spread]`.
pub fn jitter_factor(seed: u64, spread: f64) -> f64 {
    let unit = (splitmix64(seed) >> 11) as f64 / (1u64 << 53) as f64;
    1.0 - spread + 2.0 * spread * unit
}
