//! Re-armed gate used to throttle repeated log messages.
//!
//! This is not a token bucket: there is no partial credit. The first call
//! always passes and arms the gate; afterwards a call passes only once a full
//! period has elapsed since the last call that passed.

use std::time::{Duration, Instant};

/// Period between two overflow warnings of the same kind.
pub const OVERFLOW_MSG_PERIOD: Duration = Duration::from_secs(10);

/// Single-period gate.
#[derive(Debug, Clone)]
pub struct RateGate {
    period: Duration,
    /// `None` until the first call.
    last_pass: Option<Instant>,
}

impl RateGate {
    /// Create an unarmed gate with the given period.
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            last_pass: None,
        }
    }

    /// Returns `true` if the action may proceed at `now`, re-arming the gate.
    ///
    /// A `false` result leaves the gate untouched.
    pub fn try_pass(&mut self, now: Instant) -> bool {
        match self.last_pass {
            Some(last) if now.saturating_duration_since(last) < self.period => false,
            _ => {
                self.last_pass = Some(now);
                true
            },
        }
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.last_pass.is_some()
    }
}

/// Duplicate suppression for "overflow detected" warnings.
///
/// With per-event logging enabled every occurrence is reported and the gate
/// is never consulted.
#[derive(Debug, Clone)]
pub struct OverflowThrottle {
    gate: RateGate,
    log_every_event: bool,
}

impl OverflowThrottle {
    #[must_use]
    pub const fn new(period: Duration, log_every_event: bool) -> Self {
        Self {
            gate: RateGate::new(period),
            log_every_event,
        }
    }

    /// Throttle with the standard [`OVERFLOW_MSG_PERIOD`].
    #[must_use]
    pub const fn standard(log_every_event: bool) -> Self {
        Self::new(OVERFLOW_MSG_PERIOD, log_every_event)
    }

    /// Whether an overflow observed at `now` should be reported.
    pub fn should_report(&mut self, now: Instant) -> bool {
        self.log_every_event || self.gate.try_pass(now)
    }

    /// Whether reports are being suppressed between windows.
    #[must_use]
    pub const fn suppressing(&self) -> bool {
        !self.log_every_event
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.gate.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: Duration = Duration::from_millis(500);

    #[test]
    fn first_call_passes_and_arms() {
        let mut gate = RateGate::new(P);
        assert!(!gate.is_armed());
        assert!(gate.try_pass(Instant::now()));
        assert!(gate.is_armed());
    }

    #[test]
    fn calls_inside_period_are_rejected_without_rearming() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(P);
        assert!(gate.try_pass(t0));
        assert!(!gate.try_pass(t0 + Duration::from_millis(100)));
        assert!(!gate.try_pass(t0 + Duration::from_millis(499)));
        // Rejections did not move the baseline.
        assert!(gate.try_pass(t0 + P));
    }

    #[test]
    fn passing_call_resets_baseline_to_call_time() {
        let t0 = Instant::now();
        let mut gate = RateGate::new(P);
        assert!(gate.try_pass(t0));
        let t1 = t0 + Duration::from_millis(700);
        assert!(gate.try_pass(t1));
        assert!(!gate.try_pass(t1 + Duration::from_millis(400)));
        assert!(gate.try_pass(t1 + P));
    }

    #[test]
    fn throttle_suppresses_until_window_expires() {
        let t0 = Instant::now();
        let mut throttle = OverflowThrottle::standard(false);
        assert!(throttle.should_report(t0));
        assert!(!throttle.should_report(t0 + Duration::from_secs(1)));
        assert!(!throttle.should_report(t0 + Duration::from_secs(9)));
        assert!(throttle.should_report(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn throttle_reports_everything_with_per_event_logging() {
        let t0 = Instant::now();
        let mut throttle = OverflowThrottle::standard(true);
        assert!(!throttle.suppressing());
        for i in 0..5 {
            assert!(throttle.should_report(t0 + Duration::from_millis(i)));
        }
    }
}
