//! Per-event processing.
//!
//! Every record drained from the device goes through the same steps, in
//! kernel delivery order:
//!
//! 1. pace against the configured throughput ceiling (may sleep)
//! 2. convert to a [`NormalizedEvent`] stamped with the capture time
//! 3. report a hardware overflow, rate limited
//! 4. append to the event store
//! 5. hand to the rule engine
//!
//! A kernel-reported software overflow is checked once per drain, before the
//! batch is processed.

use mced_core::{Clock, KernelRecord, NormalizedEvent};
use tracing::{debug, error, info, warn};

use crate::device::{DeviceError, Drained, McelogDevice};
use crate::rules::RuleEngine;
use crate::state::DaemonState;
use crate::store::EventStore;

/// Where processed events go.
pub struct EventSinks<'a> {
    pub engine: &'a mut dyn RuleEngine,
    pub store: &'a mut dyn EventStore,
    pub clock: &'a dyn Clock,
    pub boot: i64,
    pub log_events: bool,
}

/// Drain the device and process everything read. Returns the event count.
pub fn drain_and_dispatch(
    device: &mut McelogDevice,
    state: &mut DaemonState,
    sinks: &mut EventSinks<'_>,
) -> Result<usize, DeviceError> {
    let drained = device.drain()?;
    state.stats.drains += 1;
    Ok(process_drained(state, sinks, drained))
}

/// Process one drained batch. Returns the number of events handled.
pub fn process_drained(
    state: &mut DaemonState,
    sinks: &mut EventSinks<'_>,
    drained: Drained,
) -> usize {
    let count = drained.len();
    if count == 0 {
        return 0;
    }

    if drained.software_overflow && state.software_overflow.should_report(sinks.clock.now()) {
        warn!("MCE overflow detected by software");
        if state.software_overflow.suppressing() {
            warn!(
                period_secs = state.software_overflow.period().as_secs(),
                "further overflow messages suppressed"
            );
        }
        state.stats.software_overflow_warnings += 1;
    }

    if sinks.log_events {
        debug!(count, "got MCEs");
    }

    for record in &drained.records {
        state.pacer.pace(sinks.clock);
        process_one(state, sinks, record);
    }
    count
}

fn process_one(state: &mut DaemonState, sinks: &mut EventSinks<'_>, record: &KernelRecord) {
    let event = NormalizedEvent::capture(record, sinks.boot);

    if event.hardware_overflow() && state.hardware_overflow.should_report(sinks.clock.now()) {
        warn!(bank = event.bank, cpu = event.cpu, "MCE overflow detected by hardware");
        if state.hardware_overflow.suppressing() {
            warn!(
                period_secs = state.hardware_overflow.period().as_secs(),
                "further overflow messages suppressed"
            );
        }
        state.stats.hardware_overflow_warnings += 1;
    }

    match sinks.store.append(&event) {
        Ok(index) => debug!(index, "logged MCE"),
        Err(e) => {
            error!("failed to append MCE to the event store: {e}");
            state.stats.store_failures += 1;
        },
    }

    if sinks.log_events {
        info!(bank = event.bank, cpu = event.cpu, "starting MCE handlers");
    }
    sinks.engine.dispatch(&event, &mut state.clients);
    if sinks.log_events {
        info!("completed MCE handlers");
    }
    state.stats.events_dispatched += 1;
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use mced_core::event::MCI_STATUS_OVER;
    use mced_core::{ManualClock, MceDaemonConfig};

    use super::*;
    use crate::clients::{ClientId, ClientRegistry, ClientSession};
    use crate::rules::RuleError;
    use crate::store::StoreError;

    #[derive(Default)]
    struct Recorder {
        dispatched: Vec<NormalizedEvent>,
    }

    impl RuleEngine for Recorder {
        fn load(&mut self, _confdir: &Path) -> Result<usize, RuleError> {
            Ok(0)
        }

        fn unload(&mut self, _preserve_runtime_state: bool) {}

        fn dispatch(&mut self, event: &NormalizedEvent, _clients: &mut ClientRegistry) {
            self.dispatched.push(*event);
        }

        fn register_client(&mut self, _session: &ClientSession) {}

        fn unregister_client(&mut self, _id: ClientId) {}
    }

    #[derive(Default)]
    struct FailingStore {
        attempts: u64,
    }

    impl EventStore for FailingStore {
        fn append(&mut self, _event: &NormalizedEvent) -> Result<u64, StoreError> {
            self.attempts += 1;
            Err(StoreError::Closed)
        }

        fn close(&mut self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn records(statuses: &[u64]) -> Vec<KernelRecord> {
        statuses
            .iter()
            .enumerate()
            .map(|(bank, &status)| KernelRecord {
                bank: u8::try_from(bank).unwrap(),
                status,
                ..KernelRecord::default()
            })
            .collect()
    }

    fn run_batch(
        state: &mut DaemonState,
        clock: &ManualClock,
        drained: Drained,
    ) -> (usize, Recorder, FailingStore) {
        let mut engine = Recorder::default();
        let mut store = FailingStore::default();
        let mut sinks = EventSinks {
            engine: &mut engine,
            store: &mut store,
            clock,
            boot: 9,
            log_events: false,
        };
        let n = process_drained(state, &mut sinks, drained);
        (n, engine, store)
    }

    #[test]
    fn one_dispatch_per_record_in_order() {
        let mut state = DaemonState::new(&MceDaemonConfig::default());
        let clock = ManualClock::new();
        let drained = Drained {
            records: records(&[0, MCI_STATUS_OVER, 0]),
            software_overflow: false,
        };

        let (n, engine, store) = run_batch(&mut state, &clock, drained);
        assert_eq!(n, 3);
        let banks: Vec<u8> = engine.dispatched.iter().map(|e| e.bank).collect();
        assert_eq!(banks, vec![0, 1, 2]);
        assert!(engine.dispatched.iter().all(|e| e.boot == 9));
        assert_eq!(state.stats.events_dispatched, 3);
        assert_eq!(state.stats.hardware_overflow_warnings, 1);
        // Store failures are logged, not fatal.
        assert_eq!(store.attempts, 3);
        assert_eq!(state.stats.store_failures, 3);
    }

    #[test]
    fn hardware_overflow_warnings_are_rate_limited() {
        let mut state = DaemonState::new(&MceDaemonConfig::default());
        let clock = ManualClock::new();
        let burst = || Drained {
            records: records(&[MCI_STATUS_OVER; 4]),
            software_overflow: false,
        };

        run_batch(&mut state, &clock, burst());
        assert_eq!(state.stats.hardware_overflow_warnings, 1);

        clock.advance(Duration::from_secs(5));
        run_batch(&mut state, &clock, burst());
        assert_eq!(state.stats.hardware_overflow_warnings, 1);

        clock.advance(Duration::from_secs(6));
        run_batch(&mut state, &clock, burst());
        assert_eq!(state.stats.hardware_overflow_warnings, 2);
    }

    #[test]
    fn log_events_reports_every_overflow() {
        let config = MceDaemonConfig {
            log_events: true,
            ..MceDaemonConfig::default()
        };
        let mut state = DaemonState::new(&config);
        let clock = ManualClock::new();
        run_batch(
            &mut state,
            &clock,
            Drained {
                records: records(&[MCI_STATUS_OVER; 3]),
                software_overflow: true,
            },
        );
        assert_eq!(state.stats.hardware_overflow_warnings, 3);
        assert_eq!(state.stats.software_overflow_warnings, 1);
    }

    #[test]
    fn software_overflow_checked_once_per_batch() {
        let mut state = DaemonState::new(&MceDaemonConfig::default());
        let clock = ManualClock::new();
        run_batch(
            &mut state,
            &clock,
            Drained {
                records: records(&[0, 0]),
                software_overflow: true,
            },
        );
        assert_eq!(state.stats.software_overflow_warnings, 1);
        assert_eq!(state.stats.hardware_overflow_warnings, 0);
    }

    #[test]
    fn empty_batch_does_nothing() {
        let mut state = DaemonState::new(&MceDaemonConfig::default());
        let clock = ManualClock::new();
        let (n, engine, store) = run_batch(
            &mut state,
            &clock,
            Drained {
                records: Vec::new(),
                software_overflow: true,
            },
        );
        assert_eq!(n, 0);
        assert!(engine.dispatched.is_empty());
        assert_eq!(store.attempts, 0);
        assert_eq!(state.stats.software_overflow_warnings, 0);
    }

    #[test]
    fn batch_is_paced() {
        let config = MceDaemonConfig {
            rate_limit: 100,
            ..MceDaemonConfig::default()
        };
        let mut state = DaemonState::new(&config);
        let clock = ManualClock::new();
        run_batch(
            &mut state,
            &clock,
            Drained {
                records: records(&[0; 5]),
                software_overflow: false,
            },
        );
        // First event immediate, four more 10 ms apart.
        assert_eq!(clock.sleep_count(), 4);
        assert_eq!(clock.elapsed(), Duration::from_millis(40));
    }
}
