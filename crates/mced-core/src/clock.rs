//! Time source for the pacing and throttling primitives.
//!
//! Production code uses [`SystemClock`]. [`ManualClock`] lets tests drive time
//! explicitly, including a configurable sleep overshoot to model an imprecise
//! sleep primitive.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Monotonic clock plus the ability to sleep against it.
pub trait Clock {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for roughly `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real monotonic clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock for deterministic tests.
///
/// `sleep` advances the clock by the requested duration plus the configured
/// overshoot and records the requested duration.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Cell<Duration>,
    overshoot: Cell<Duration>,
    sleeps: Cell<usize>,
    last_sleep: Cell<Option<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// New clock at an arbitrary origin with exact sleeps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            overshoot: Cell::new(Duration::ZERO),
            sleeps: Cell::new(0),
            last_sleep: Cell::new(None),
        }
    }

    /// Every subsequent sleep wakes `overshoot` late.
    #[must_use]
    pub fn with_overshoot(self, overshoot: Duration) -> Self {
        self.overshoot.set(overshoot);
        self
    }

    /// Move time forward without sleeping.
    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    /// Time elapsed since the clock's origin.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }

    /// Number of sleeps performed.
    #[must_use]
    pub fn sleep_count(&self) -> usize {
        self.sleeps.get()
    }

    /// Duration requested by the most recent sleep.
    #[must_use]
    pub fn last_sleep(&self) -> Option<Duration> {
        self.last_sleep.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
        self.last_sleep.set(Some(duration));
        self.advance(duration + self.overshoot.get());
    }
}

/// Signed microseconds from `earlier` to `later`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn signed_micros(later: Instant, earlier: Instant) -> i64 {
    match later.checked_duration_since(earlier) {
        Some(d) => d.as_micros() as i64,
        None => -(earlier.duration_since(later).as_micros() as i64),
    }
}
