//! Per-event throughput ceiling.
//!
//! [`EventPacer`] spaces event processing so that no more than `ceiling`
//! events per second are handled. It is a feedback-controlled sleeper rather
//! than a token bucket:
//!
//! - The baseline advances to the *ideal* time (`now + deficit`), not to the
//!   time the sleep actually returned, so sleep imprecision does not compound.
//! - After each sleep the miss between the real wake time and the ideal
//!   baseline is folded into a running bias at one eighth of its size. Large
//!   one-off transients barely move the bias; a persistent overshoot of the
//!   sleep primitive is gradually cancelled.

use std::time::Duration;

use crate::clock::{signed_micros, Clock};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Integration divisor for the bias correction.
pub const BIAS_DIVISOR: i64 = 8;

/// Pacing state. Created once at startup, never reset.
#[derive(Debug, Clone)]
pub struct EventPacer {
    ceiling: i64,
    /// Ideal time of the previous event; `None` before the first event.
    ideal: Option<std::time::Instant>,
    bias_us: i64,
    last_miss_us: i64,
}

impl EventPacer {
    /// A pacer allowing `ceiling` events per second. A ceiling of zero or
    /// less disables pacing.
    #[must_use]
    pub const fn new(ceiling: i64) -> Self {
        Self {
            ceiling,
            ideal: None,
            bias_us: 0,
            last_miss_us: 0,
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.ceiling > 0
    }

    /// Minimum spacing between two events, if pacing is enabled.
    #[must_use]
    pub const fn spacing_us(&self) -> Option<i64> {
        if self.ceiling > 0 {
            Some(MICROS_PER_SEC / self.ceiling)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn bias_us(&self) -> i64 {
        self.bias_us
    }

    /// Miss measured after the most recent sleep.
    #[must_use]
    pub const fn last_miss_us(&self) -> i64 {
        self.last_miss_us
    }

    /// Called once per event, before the event is processed. May sleep.
    ///
    /// Returns the duration slept, if any.
    #[allow(clippy::cast_sign_loss)]
    pub fn pace<C: Clock + ?Sized>(&mut self, clock: &C) -> Option<Duration> {
        let spacing = self.spacing_us()?;

        let now = clock.now();
        let Some(previous) = self.ideal else {
            self.ideal = Some(now);
            return None;
        };

        let elapsed = signed_micros(now, previous);
        self.ideal = Some(now);
        if elapsed >= spacing {
            return None;
        }

        let deficit = spacing - elapsed;
        let ideal = now + Duration::from_micros(deficit as u64);
        self.ideal = Some(ideal);

        let wanted = deficit + self.bias_us;
        let slept = (wanted > 0).then(|| {
            let d = Duration::from_micros(wanted as u64);
            clock.sleep(d);
            d
        });

        let missed_by = signed_micros(clock.now(), ideal);
        self.last_miss_us = missed_by;
        self.bias_us -= missed_by / BIAS_DIVISOR;
        slept
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn disabled_pacer_never_sleeps() {
        let clock = ManualClock::new();
        for ceiling in [0, -1, -100] {
            let mut pacer = EventPacer::new(ceiling);
            assert!(!pacer.enabled());
            for _ in 0..10 {
                assert_eq!(pacer.pace(&clock), None);
            }
        }
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn first_event_is_not_delayed() {
        let clock = ManualClock::new();
        let mut pacer = EventPacer::new(100);
        assert_eq!(pacer.pace(&clock), None);
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn slow_arrivals_are_not_delayed() {
        let clock = ManualClock::new();
        let mut pacer = EventPacer::new(100);
        pacer.pace(&clock);
        for _ in 0..5 {
            clock.advance(Duration::from_millis(15));
            assert_eq!(pacer.pace(&clock), None);
        }
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn sleeps_for_deficit_when_events_arrive_early() {
        let clock = ManualClock::new();
        let mut pacer = EventPacer::new(100);
        pacer.pace(&clock);
        clock.advance(Duration::from_millis(4));
        assert_eq!(pacer.pace(&clock), Some(Duration::from_millis(6)));
    }

    #[test]
    fn burst_is_spaced_at_least_one_period_apart_with_exact_sleep() {
        let clock = ManualClock::new();
        let mut pacer = EventPacer::new(250);
        let spacing = pacer.spacing_us().unwrap();

        let mut emitted = Vec::new();
        for _ in 0..50 {
            pacer.pace(&clock);
            emitted.push(clock.now());
        }

        for pair in emitted.windows(2) {
            assert!(signed_micros(pair[1], pair[0]) >= spacing);
        }
        assert_eq!(pacer.bias_us(), 0);
    }

    #[test]
    fn bias_cancels_constant_sleep_overshoot() {
        let overshoot = 800;
        let clock = ManualClock::new().with_overshoot(Duration::from_micros(overshoot));
        let mut pacer = EventPacer::new(100);

        pacer.pace(&clock);
        pacer.pace(&clock);
        let first_miss = pacer.last_miss_us();
        assert_eq!(first_miss, 800);

        for _ in 0..200 {
            pacer.pace(&clock);
        }

        // Miss converges below the integration granularity and the bias
        // converges on the negated overshoot.
        assert!(pacer.last_miss_us().abs() < BIAS_DIVISOR);
        assert!(pacer.last_miss_us().abs() < first_miss);
        let bias = pacer.bias_us();
        assert!(
            (-(overshoot as i64)..=-(overshoot as i64) + BIAS_DIVISOR).contains(&bias),
            "bias {bias} did not converge"
        );
    }

    #[test]
    fn single_late_wakeup_moves_bias_by_one_eighth() {
        let late = ManualClock::new().with_overshoot(Duration::from_micros(4_000));
        let mut pacer = EventPacer::new(100);
        pacer.pace(&late);
        pacer.pace(&late);
        assert_eq!(pacer.last_miss_us(), 4_000);
        assert_eq!(pacer.bias_us(), -500);
    }

    #[test]
    fn baseline_tracks_ideal_time_not_wake_time() {
        let clock = ManualClock::new().with_overshoot(Duration::from_micros(1_000));
        let mut pacer = EventPacer::new(100);
        pacer.pace(&clock);
        pacer.pace(&clock);
        // Woke at 11 ms; the next deficit is measured from the 10 ms ideal.
        clock.advance(Duration::from_millis(2));
        let slept = pacer.pace(&clock).unwrap();
        // deficit = 10 ms - 3 ms, bias = -125 us
        assert_eq!(slept, Duration::from_micros(7_000 - 125));
    }
}
