//! Adaptive poll timeout.
//!
//! The timeout starts at the configured maximum, doubles (up to the maximum)
//! after an idle timeout and halves (down to the minimum) whenever events were
//! drained. A maximum of zero or less disables interval polling entirely; the
//! device is then only serviced through readiness notification.

use std::time::Duration;

/// Poll timeout controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    /// Interval polling disabled; waits block until readiness.
    Disabled,
    /// Adaptive interval in milliseconds, always within `[min_ms, max_ms]`.
    Adaptive {
        current_ms: u64,
        min_ms: u64,
        max_ms: u64,
    },
}

impl PollInterval {
    /// Build from configured bounds. `max_ms <= 0` disables the controller;
    /// `min_ms <= 0` means no floor. A minimum above the maximum is clamped to
    /// the maximum.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn new(min_ms: i64, max_ms: i64) -> Self {
        if max_ms <= 0 {
            return Self::Disabled;
        }
        let max_ms = max_ms as u64;
        let min_ms = (min_ms.max(0) as u64).min(max_ms);
        Self::Adaptive {
            current_ms: max_ms,
            min_ms,
            max_ms,
        }
    }

    /// A fixed, non-adaptive fallback used when the device must be polled
    /// but the configuration disabled interval polling.
    #[must_use]
    pub const fn fixed(ms: u64) -> Self {
        Self::Adaptive {
            current_ms: ms,
            min_ms: ms,
            max_ms: ms,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Adaptive { .. })
    }

    /// Timeout for the next wait, `None` meaning block indefinitely.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Adaptive { current_ms, .. } => Some(Duration::from_millis(*current_ms)),
        }
    }

    #[must_use]
    pub const fn current_ms(&self) -> Option<u64> {
        match self {
            Self::Disabled => None,
            Self::Adaptive { current_ms, .. } => Some(*current_ms),
        }
    }

    /// Feed back the outcome of one loop iteration in which the device was
    /// serviced.
    pub fn observe(&mut self, drained: usize, timed_out: bool) {
        let Self::Adaptive {
            current_ms,
            min_ms,
            max_ms,
        } = self
        else {
            return;
        };

        if drained == 0 && timed_out {
            // A zero floor must not pin the loop at a zero timeout.
            *current_ms = current_ms.saturating_mul(2).max(1).min(*max_ms);
        } else if drained > 0 {
            *current_ms = (*current_ms / 2).max(*min_ms);
        }
    }
}
