//! Lifecycle controller.
//!
//! [`Daemon`] owns every long-lived resource (device, listening socket,
//! signal channel, rule engine, event store, pid file) together with the
//! loop's [`DaemonState`], and runs the single-threaded event loop.
//!
//! # Loop Iteration
//!
//! 0. Act on pending signals: terminate wins over reload.
//! 1. Make sure the device is open. Every successful open is followed by the
//!    readiness probe.
//! 2. Wait on the signal channel, the device (when its readiness can be
//!    trusted) and the listener (when enabled).
//! 3. Prune dead clients.
//! 4. Drain and process the device when it reported readiness, or when the
//!    wait timed out and the device is interval-polled.
//! 5. Admit a pending client.
//!
//! # Shutdown
//!
//! A terminating signal, a fifo device whose writer went away, or too many
//! consecutive accept failures end the loop. Shutdown runs exactly once:
//! rules are unloaded, clients closed, the store closed, and the socket and
//! pid files removed.

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mced_core::config::DEFAULT_MAX_INTERVAL_MS;
use mced_core::{Clock, MceDaemonConfig, PollInterval, SystemClock};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clients::{accept_client, AcceptOutcome, ClientSocket};
use crate::device::{DeviceError, McelogDevice, OpenFailure};
use crate::events::{drain_and_dispatch, EventSinks};
use crate::pidfile::PidFile;
use crate::rules::{RuleEngine, RuleError};
use crate::signals::SignalChannel;
use crate::state::DaemonState;
use crate::store::EventStore;

/// Startup errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to load rules: {0}")]
    Rules(#[from] RuleError),

    #[error("failed to open event device: {0}")]
    Device(#[from] DeviceError),

    #[error("can't create pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A terminating signal arrived.
    Signal(i32),
    /// The writer of a fake (fifo) device closed it.
    DeviceClosed,
    /// `accept()` kept failing.
    AcceptFailures,
}

impl ShutdownReason {
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::AcceptFailures)
    }

    /// Process exit status for this reason.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        if self.is_failure() {
            1
        } else {
            0
        }
    }
}

struct OpenDevice {
    device: McelogDevice,
    poll_supported: bool,
}

/// What one wait reported.
#[derive(Debug, Default)]
struct WaitOutcome {
    timed_out: bool,
    signal_ready: bool,
    device: Option<PollFlags>,
    listener: Option<PollFlags>,
}

/// The running daemon.
pub struct Daemon {
    config: MceDaemonConfig,
    state: DaemonState,
    device: Option<OpenDevice>,
    socket: Option<ClientSocket>,
    signals: SignalChannel,
    engine: Box<dyn RuleEngine>,
    store: Box<dyn EventStore>,
    clock: Box<dyn Clock>,
    pid_file_path: Option<PathBuf>,
    pid_file: Option<PidFile>,
    finished: Option<ShutdownReason>,
}

impl Daemon {
    #[must_use]
    pub fn new(
        config: MceDaemonConfig,
        signals: SignalChannel,
        engine: Box<dyn RuleEngine>,
        store: Box<dyn EventStore>,
    ) -> Self {
        Self {
            state: DaemonState::new(&config),
            config,
            device: None,
            socket: None,
            signals,
            engine,
            store,
            clock: Box::new(SystemClock),
            pid_file_path: None,
            pid_file: None,
            finished: None,
        }
    }

    /// Serve clients on an already bound socket.
    #[must_use]
    pub fn with_socket(mut self, socket: ClientSocket) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Create a pid file at `path` once startup has succeeded.
    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &MceDaemonConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> &DaemonState {
        &self.state
    }

    #[must_use]
    pub const fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_ref().map(ClientSocket::path)
    }

    /// Whether readiness notification is trusted for the open device;
    /// `None` while no device is open.
    #[must_use]
    pub fn device_poll_supported(&self) -> Option<bool> {
        self.device.as_ref().map(|open| open.poll_supported)
    }

    /// Load rules, open the device and write the pid file.
    ///
    /// A device that cannot be opened is fatal unless `retry_device` is set.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        self.engine.load(&self.config.confdir)?;

        if let Err(e) = self.open_device() {
            if !self.config.retry_device {
                return Err(e.into());
            }
        }

        if let Some(path) = &self.pid_file_path {
            let pid_file = PidFile::create(path).map_err(|source| DaemonError::PidFile {
                path: path.clone(),
                source,
            })?;
            self.pid_file = Some(pid_file);
        }

        info!(
            log_events = self.config.log_events,
            "waiting for events: per-event logging is {}",
            if self.config.log_events { "on" } else { "off" }
        );
        Ok(())
    }

    /// Run until shutdown.
    pub fn run(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = self.run_once() {
                return reason;
            }
        }
    }

    /// One loop iteration. Returns the reason once the daemon has shut down.
    pub fn run_once(&mut self) -> Option<ShutdownReason> {
        if let Some(reason) = self.finished {
            return Some(reason);
        }
        if let Some(reason) = self.handle_signals() {
            return Some(self.shutdown(reason));
        }

        self.ensure_device();

        let outcome = match self.wait(self.wait_timeout()) {
            Ok(outcome) => outcome,
            Err(Errno::EINTR) => return None,
            Err(errno) => {
                error!("poll(): {errno}");
                return None;
            },
        };
        if outcome.signal_ready {
            self.signals.drain_wakeups();
        }

        for id in self.state.clients.prune_dead() {
            self.engine.unregister_client(id);
            self.state.stats.clients_pruned += 1;
        }

        if let Some(reason) = self.service_device(&outcome) {
            return Some(self.shutdown(reason));
        }
        if let Some(reason) = self.service_listener(outcome.listener) {
            return Some(self.shutdown(reason));
        }
        None
    }

    fn handle_signals(&mut self) -> Option<ShutdownReason> {
        let pending = self.signals.take_pending();
        if let Some(sig) = pending.terminate {
            return Some(ShutdownReason::Signal(sig));
        }
        if pending.reload {
            self.reload();
        }
        None
    }

    /// Re-read rules. Clients, pacing, the interval and quotas are untouched.
    fn reload(&mut self) {
        info!(confdir = %self.config.confdir.display(), "reloading configuration");
        self.engine.unload(true);
        if let Err(e) = self.engine.load(&self.config.confdir) {
            error!("failed to reload rules: {e}");
        }
        self.state.stats.reloads += 1;
    }

    fn ensure_device(&mut self) {
        if self.device.is_none() && self.config.retry_device {
            // Failures are reported by the open itself.
            let _ = self.open_device();
        }
    }

    fn open_device(&mut self) -> Result<(), DeviceError> {
        let mut device = match McelogDevice::open(&self.config.device, &mut self.state.open_failures)
        {
            Ok(device) => device,
            Err(e) => {
                self.state.stats.device_failures += 1;
                if self.config.retry_device
                    && self.state.open_failures.first(OpenFailure::RetryNotice)
                {
                    warn!(device = %self.config.device.display(), "will keep retrying the device");
                }
                return Err(e);
            },
        };
        self.state.stats.device_opens += 1;

        let Self {
            config,
            state,
            engine,
            store,
            clock,
            ..
        } = self;
        let mut sinks = EventSinks {
            engine: &mut **engine,
            store: &mut **store,
            clock: &**clock,
            boot: config.boot,
            log_events: config.log_events,
        };
        let poll_supported =
            device.detect_readiness_support(|dev| drain_and_dispatch(dev, state, &mut sinks));

        if !poll_supported {
            warn!(
                device = %self.config.device.display(),
                "poll() on the device is not reliable, checking it on an interval"
            );
            if !self.state.interval.is_enabled() {
                self.state.interval = PollInterval::fixed(DEFAULT_MAX_INTERVAL_MS.unsigned_abs());
            }
        }
        self.device = Some(OpenDevice {
            device,
            poll_supported,
        });
        Ok(())
    }

    fn wait_timeout(&self) -> Option<Duration> {
        let device_needs_timeout = match &self.device {
            None => self.config.retry_device,
            Some(open) => !open.poll_supported,
        };
        match self.state.interval.timeout() {
            Some(timeout) => Some(timeout),
            None if device_needs_timeout => {
                Some(Duration::from_millis(DEFAULT_MAX_INTERVAL_MS.unsigned_abs()))
            },
            None => None,
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, Errno> {
        let mut fds = Vec::with_capacity(3);
        fds.push(PollFd::new(self.signals.as_fd(), PollFlags::POLLIN));
        let device_slot = self
            .device
            .as_ref()
            .filter(|open| open.poll_supported)
            .map(|open| {
                fds.push(PollFd::new(open.device.as_fd(), PollFlags::POLLIN));
                fds.len() - 1
            });
        let listener_slot = self.socket.as_ref().map(|socket| {
            fds.push(PollFd::new(socket.listener().as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });

        let ready = poll(&mut fds, poll_timeout(timeout))?;
        let revents = |slot: usize| fds[slot].revents().unwrap_or_else(PollFlags::empty);
        Ok(WaitOutcome {
            timed_out: ready == 0,
            signal_ready: !revents(0).is_empty(),
            device: device_slot.map(revents),
            listener: listener_slot.map(revents),
        })
    }

    fn service_device(&mut self, outcome: &WaitOutcome) -> Option<ShutdownReason> {
        let open = self.device.as_mut()?;
        let ready = outcome.device.is_some_and(|flags| !flags.is_empty());
        let interval_polled = !open.poll_supported || self.state.interval.is_enabled();
        if !ready && !(outcome.timed_out && interval_polled) {
            return None;
        }

        let mut sinks = EventSinks {
            engine: &mut *self.engine,
            store: &mut *self.store,
            clock: &*self.clock,
            boot: self.config.boot,
            log_events: self.config.log_events,
        };
        match drain_and_dispatch(&mut open.device, &mut self.state, &mut sinks) {
            Ok(0) if open.device.is_fake() && !outcome.timed_out => {
                info!("fake mcelog device closed");
                Some(ShutdownReason::DeviceClosed)
            },
            Ok(drained) => {
                self.state.interval.observe(drained, outcome.timed_out);
                None
            },
            Err(e) if e.is_disconnect() => {
                error!("{e}");
                self.state.stats.device_failures += 1;
                self.device = None;
                if self.config.retry_device {
                    warn!("device closed, will reopen");
                } else {
                    error!("device closed, no longer reading events");
                }
                None
            },
            Err(e) => {
                error!("failed to drain device: {e}");
                self.state.stats.device_failures += 1;
                None
            },
        }
    }

    fn service_listener(&mut self, flags: Option<PollFlags>) -> Option<ShutdownReason> {
        let flags = flags?;
        if flags.is_empty() {
            return None;
        }
        if !flags.contains(PollFlags::POLLIN) {
            warn!("odd, poll set flags {flags:?} on the client socket");
            return None;
        }
        let socket = self.socket.as_ref()?;

        let outcome = accept_client(
            socket.listener(),
            &mut self.state.clients,
            &mut self.state.accept,
        );
        self.handle_accept(outcome)
    }

    fn handle_accept(&mut self, outcome: AcceptOutcome) -> Option<ShutdownReason> {
        match outcome {
            AcceptOutcome::Admitted(id) => {
                self.state.stats.clients_admitted += 1;
                if let Some(session) = self.state.clients.get(id) {
                    self.engine.register_client(session);
                }
                None
            },
            AcceptOutcome::Rejected => {
                self.state.stats.clients_rejected += 1;
                None
            },
            AcceptOutcome::NotReady => None,
            AcceptOutcome::Failed { tripped } => {
                self.state.stats.accept_failures += 1;
                if tripped {
                    error!(
                        failures = self.state.accept.consecutive(),
                        "too many accept() errors, giving up"
                    );
                    Some(ShutdownReason::AcceptFailures)
                } else {
                    None
                }
            },
        }
    }

    /// Release everything. Runs once; later calls return the first reason.
    pub fn shutdown(&mut self, reason: ShutdownReason) -> ShutdownReason {
        if let Some(first) = self.finished {
            return first;
        }
        match reason {
            ShutdownReason::Signal(sig) => info!(signal = sig, "caught signal, shutting down"),
            ShutdownReason::DeviceClosed => info!("event device closed, shutting down"),
            ShutdownReason::AcceptFailures => error!("client socket failing, shutting down"),
        }

        self.engine.unload(false);
        let closed = self.state.clients.close_all();
        debug!(clients = closed, "clients closed");
        if let Err(e) = self.store.close() {
            error!("failed to close event store: {e}");
        }
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.cleanup() {
                warn!("failed to remove client socket: {e}");
            }
        }
        if let Some(pid_file) = self.pid_file.take() {
            pid_file.remove();
        }
        self.device = None;

        self.state.log_summary();
        info!("exiting");
        self.finished = Some(reason);
        reason
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    timeout.map_or(PollTimeout::NONE, |d| {
        let ms = i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
        PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MAX_ACCEPT_FAILURES;
    use crate::device::DeviceMode;
    use crate::rules::ClientBroadcast;
    use crate::store::NullEventStore;

    fn daemon(config: MceDaemonConfig) -> Daemon {
        Daemon::new(
            config,
            SignalChannel::new().unwrap(),
            Box::new(ClientBroadcast::new()),
            Box::new(NullEventStore::default()),
        )
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ShutdownReason::Signal(15).exit_code(), 0);
        assert_eq!(ShutdownReason::DeviceClosed.exit_code(), 0);
        assert_eq!(ShutdownReason::AcceptFailures.exit_code(), 1);
    }

    #[test]
    fn poll_timeout_conversion() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::ZERO);
        assert_eq!(
            poll_timeout(Some(Duration::from_millis(250))),
            PollTimeout::try_from(250_i32).unwrap()
        );
    }

    #[test]
    fn missing_device_is_fatal_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().to_path_buf(),
            device: dir.path().join("absent"),
            ..MceDaemonConfig::default()
        };
        let mut daemon = daemon(config);
        assert!(matches!(
            daemon.start(),
            Err(DaemonError::Device(DeviceError::NotFound { .. }))
        ));
    }

    #[test]
    fn missing_device_is_retried_with_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().to_path_buf(),
            device: dir.path().join("absent"),
            retry_device: true,
            max_interval_ms: -1,
            ..MceDaemonConfig::default()
        };
        let mut daemon = daemon(config);
        daemon.start().unwrap();
        assert_eq!(daemon.device_poll_supported(), None);
        assert_eq!(
            daemon.wait_timeout(),
            Some(Duration::from_millis(DEFAULT_MAX_INTERVAL_MS.unsigned_abs()))
        );
        assert!(daemon
            .state()
            .open_failures
            .was_reported(OpenFailure::RetryNotice));
    }

    #[test]
    fn bad_confdir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().join("absent"),
            ..MceDaemonConfig::default()
        };
        assert!(matches!(daemon(config).start(), Err(DaemonError::Rules(_))));
    }

    #[test]
    fn failed_drain_keeps_the_device_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"not a device").unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().to_path_buf(),
            device: path.clone(),
            ..MceDaemonConfig::default()
        };
        let mut daemon = daemon(config);
        let file = std::fs::File::open(&path).unwrap();
        daemon.device = Some(OpenDevice {
            device: McelogDevice::from_open_file(file, &path, DeviceMode::Kernel),
            poll_supported: false,
        });

        let timed_out = WaitOutcome {
            timed_out: true,
            ..WaitOutcome::default()
        };
        // The log-length ioctl fails on a plain file.
        assert_eq!(daemon.service_device(&timed_out), None);
        assert_eq!(daemon.service_device(&timed_out), None);
        assert_eq!(daemon.device_poll_supported(), Some(false));
        assert_eq!(daemon.state().stats.device_failures, 2);
    }

    #[test]
    fn accept_storm_shuts_down_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().to_path_buf(),
            ..MceDaemonConfig::default()
        };
        let mut daemon = daemon(config);

        for _ in 1..MAX_ACCEPT_FAILURES {
            let tripped = daemon.state.accept.record_failure();
            assert_eq!(daemon.handle_accept(AcceptOutcome::Failed { tripped }), None);
        }
        let tripped = daemon.state.accept.record_failure();
        let reason = daemon
            .handle_accept(AcceptOutcome::Failed { tripped })
            .unwrap();
        assert_eq!(reason, ShutdownReason::AcceptFailures);
        assert_eq!(daemon.shutdown(reason).exit_code(), 1);
        assert_eq!(
            daemon.state().stats.accept_failures,
            u64::from(MAX_ACCEPT_FAILURES)
        );
    }

    #[test]
    fn shutdown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig {
            confdir: dir.path().to_path_buf(),
            ..MceDaemonConfig::default()
        };
        let mut daemon = daemon(config);
        let first = daemon.shutdown(ShutdownReason::Signal(2));
        let second = daemon.shutdown(ShutdownReason::AcceptFailures);
        assert_eq!(first, second);
        assert_eq!(daemon.run_once(), Some(ShutdownReason::Signal(2)));
    }
}
