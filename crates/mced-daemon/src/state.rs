//! Daemon state.
//!
//! Everything the event loop mutates between iterations lives in one
//! [`DaemonState`], built once from the configuration at startup. Nothing in
//! here is reset by a configuration reload.

use chrono::{DateTime, Utc};
use mced_core::{EventPacer, MceDaemonConfig, OverflowThrottle, PollInterval};
use tracing::info;

use crate::clients::{AcceptBreaker, ClientRegistry};
use crate::device::OpenFailureLog;

/// Counters reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub drains: u64,
    pub events_dispatched: u64,
    pub hardware_overflow_warnings: u64,
    pub software_overflow_warnings: u64,
    pub store_failures: u64,
    pub clients_admitted: u64,
    pub clients_rejected: u64,
    pub clients_pruned: u64,
    pub accept_failures: u64,
    pub reloads: u64,
    pub device_opens: u64,
    pub device_failures: u64,
}

impl DaemonStats {
    #[must_use]
    pub const fn overflow_warnings(&self) -> u64 {
        self.hardware_overflow_warnings + self.software_overflow_warnings
    }
}

/// Mutable state of the event loop.
#[derive(Debug)]
pub struct DaemonState {
    pub pacer: EventPacer,
    pub hardware_overflow: OverflowThrottle,
    pub software_overflow: OverflowThrottle,
    pub interval: PollInterval,
    pub clients: ClientRegistry,
    pub accept: AcceptBreaker,
    pub open_failures: OpenFailureLog,
    pub stats: DaemonStats,
    started_at: DateTime<Utc>,
}

impl DaemonState {
    #[must_use]
    pub fn new(config: &MceDaemonConfig) -> Self {
        Self {
            pacer: EventPacer::new(config.rate_limit),
            hardware_overflow: OverflowThrottle::standard(config.log_events),
            software_overflow: OverflowThrottle::standard(config.log_events),
            interval: PollInterval::new(config.min_interval_ms, config.max_interval_ms),
            clients: ClientRegistry::new(config.client_max),
            accept: AcceptBreaker::default(),
            open_failures: OpenFailureLog::default(),
            stats: DaemonStats::default(),
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Log the run's counters.
    pub fn log_summary(&self) {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        let s = &self.stats;
        info!(
            uptime_secs = uptime.num_seconds(),
            drains = s.drains,
            events = s.events_dispatched,
            overflow_warnings = s.overflow_warnings(),
            store_failures = s.store_failures,
            clients_admitted = s.clients_admitted,
            clients_rejected = s.clients_rejected,
            clients_pruned = s.clients_pruned,
            accept_failures = s.accept_failures,
            reloads = s.reloads,
            device_opens = s.device_opens,
            "daemon statistics"
        );
    }
}
