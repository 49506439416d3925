//! `/dev/mcelog` reader.
//!
//! Opens the kernel event device, detects whether `poll()` on it can be
//! trusted, and drains queued [`KernelRecord`]s.
//!
//! # Device Modes
//!
//! - **Kernel**: a character device. The record length, log length and
//!   overflow flags are queried with ioctls.
//! - **Fifo**: a named pipe standing in for the device in tests. No ioctls are
//!   issued; the record length is assumed and the queued count is reported
//!   optimistically so that `read()` decides how many records there are.
//!
//! # Failure Reporting
//!
//! Opening is retried by the event loop when `retry_device` is configured.
//! Every distinct failure cause is logged once ([`OpenFailureLog`]) so a
//! device that stays broken does not flood the log, while a change of cause is
//! still reported.

// ioctl wrappers and their call sites.
#![allow(unsafe_code)]

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use mced_core::{KernelRecord, KERNEL_RECORD_LEN};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Upper bound on records read in one drain, whatever the device reports.
pub const MAX_RECORDS_PER_DRAIN: usize = 256;

/// Queued-record count assumed for a fifo device.
pub const FIFO_BATCH_RECORDS: usize = 32;

/// Zero-timeout polls the readiness probe performs before giving up.
pub const MAX_PROBE_ROUNDS: usize = 16;

/// `MCE_GETCLEAR_FLAGS` bit: the kernel log overflowed.
const MCE_FLAG_OVERFLOW: libc::c_int = 1 << 0;

nix::ioctl_read!(mce_get_record_len, b'M', 1, libc::c_int);
nix::ioctl_read!(mce_get_log_len, b'M', 2, libc::c_int);
nix::ioctl_read!(mce_getclear_flags, b'M', 3, libc::c_int);

/// Device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The path does not exist.
    #[error("{}: no such device", path.display())]
    NotFound { path: PathBuf },

    /// The path exists but does not behave like an mcelog device.
    #[error("{}: unsupported device: {reason}", path.display())]
    Unsupported { path: PathBuf, reason: String },

    /// Another process holds the device open exclusively.
    #[error("{}: device busy", path.display())]
    Busy { path: PathBuf },

    /// A genuine I/O failure.
    #[error("{op} on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    fn io(path: &Path, op: &'static str, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            op,
            source,
        }
    }

    /// Whether the descriptor itself is gone, as opposed to one failed call.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.raw_os_error(),
                Some(libc::EBADF | libc::ENODEV | libc::ENXIO)
            ),
            _ => false,
        }
    }
}

/// Distinct causes that are each reported once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenFailure {
    Stat,
    FakeDevice,
    Open,
    RecordLenQuery,
    RecordLenUnsupported,
    RetryNotice,
}

/// One-shot flags for open-time diagnostics.
#[derive(Debug, Default)]
pub struct OpenFailureLog {
    reported: HashSet<OpenFailure>,
}

impl OpenFailureLog {
    /// Returns `true` the first time `cause` is seen.
    pub fn first(&mut self, cause: OpenFailure) -> bool {
        self.reported.insert(cause)
    }

    #[must_use]
    pub fn was_reported(&self, cause: OpenFailure) -> bool {
        self.reported.contains(&cause)
    }
}

/// Capability mode of an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Kernel,
    Fifo,
}

/// Result of one drain.
#[derive(Debug, Default)]
pub struct Drained {
    /// Records in kernel delivery order.
    pub records: Vec<KernelRecord>,
    /// The kernel reported that its log overflowed (kernel mode only).
    pub software_overflow: bool,
}

impl Drained {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// An open event device.
#[derive(Debug)]
pub struct McelogDevice {
    file: File,
    path: PathBuf,
    mode: DeviceMode,
    /// Bytes of a record whose remainder has not been read yet.
    partial: Vec<u8>,
}

impl McelogDevice {
    /// Open `path` read-only, non-blocking, exclusive and close-on-exec.
    pub fn open(path: &Path, failures: &mut OpenFailureLog) -> Result<Self, DeviceError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                if failures.first(OpenFailure::Stat) {
                    error!(device = %path.display(), "can't stat device: {e}");
                }
                return Err(if e.kind() == io::ErrorKind::NotFound {
                    DeviceError::NotFound {
                        path: path.to_path_buf(),
                    }
                } else {
                    DeviceError::io(path, "stat", e)
                });
            },
        };

        let mode = if metadata.file_type().is_fifo() {
            if failures.first(OpenFailure::FakeDevice) {
                warn!(device = %path.display(), "using a fake mcelog device");
            }
            DeviceMode::Fifo
        } else {
            DeviceMode::Kernel
        };

        // std opens with O_CLOEXEC.
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_EXCL)
            .open(path)
            .map_err(|e| {
                if failures.first(OpenFailure::Open) {
                    error!(device = %path.display(), "can't open device: {e}");
                }
                match e.raw_os_error() {
                    Some(libc::EBUSY) => DeviceError::Busy {
                        path: path.to_path_buf(),
                    },
                    Some(libc::ENOENT) => DeviceError::NotFound {
                        path: path.to_path_buf(),
                    },
                    _ => DeviceError::io(path, "open", e),
                }
            })?;

        let record_len = match mode {
            DeviceMode::Fifo => KERNEL_RECORD_LEN,
            DeviceMode::Kernel => {
                let mut len: libc::c_int = 0;
                // SAFETY: the descriptor is owned by `file` and stays open for
                // the call; `len` is a valid, writable c_int.
                let queried = unsafe { mce_get_record_len(file.as_raw_fd(), &mut len) };
                if let Err(errno) = queried {
                    if failures.first(OpenFailure::RecordLenQuery) {
                        error!(device = %path.display(), "can't get MCE record size: {errno}");
                    }
                    return Err(DeviceError::Unsupported {
                        path: path.to_path_buf(),
                        reason: format!("MCE_GET_RECORD_LEN failed: {errno}"),
                    });
                }
                usize::try_from(len).unwrap_or(0)
            },
        };

        if record_len != KERNEL_RECORD_LEN {
            if failures.first(OpenFailure::RecordLenUnsupported) {
                error!(
                    device = %path.display(),
                    record_len,
                    "kernel MCE record size is unsupported"
                );
            }
            return Err(DeviceError::Unsupported {
                path: path.to_path_buf(),
                reason: format!("record size {record_len}, expected {KERNEL_RECORD_LEN}"),
            });
        }

        info!(device = %path.display(), ?mode, "opened mcelog device");
        Ok(Self::from_file(file, path, mode))
    }

    fn from_file(file: File, path: &Path, mode: DeviceMode) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            mode,
            partial: Vec::new(),
        }
    }

    /// Wrap an already open file, skipping the open-time checks.
    #[cfg(test)]
    pub(crate) fn from_open_file(file: File, path: &Path, mode: DeviceMode) -> Self {
        Self::from_file(file, path, mode)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> DeviceMode {
        self.mode
    }

    #[must_use]
    pub fn is_fake(&self) -> bool {
        self.mode == DeviceMode::Fifo
    }

    /// Number of records the kernel may have queued, bounded by
    /// [`MAX_RECORDS_PER_DRAIN`].
    pub fn record_count(&self) -> Result<usize, DeviceError> {
        match self.mode {
            DeviceMode::Fifo => Ok(FIFO_BATCH_RECORDS),
            DeviceMode::Kernel => {
                let mut len: libc::c_int = 0;
                // SAFETY: see `open`.
                let queried = unsafe { mce_get_log_len(self.file.as_raw_fd(), &mut len) };
                queried.map_err(|errno| {
                    DeviceError::io(&self.path, "ioctl(MCE_GET_LOG_LEN)", errno.into())
                })?;
                Ok(usize::try_from(len)
                    .unwrap_or(0)
                    .min(MAX_RECORDS_PER_DRAIN))
            },
        }
    }

    /// Read every available record in one system call.
    ///
    /// Nothing ready is an empty result, not an error. For a fifo an empty
    /// result can also mean the writer has gone away. A trailing partial
    /// record is held back and completed by the next read.
    pub fn drain(&mut self) -> Result<Drained, DeviceError> {
        let count = self.record_count()?;
        if count == 0 {
            return Ok(Drained::default());
        }

        let carried = self.partial.len();
        let mut buf = vec![0u8; count * KERNEL_RECORD_LEN];
        buf[..carried].copy_from_slice(&self.partial);
        let n = match self.file.read(&mut buf[carried..]) {
            Ok(n) => n,
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
            {
                return Ok(Drained::default());
            },
            Err(e) => return Err(DeviceError::io(&self.path, "read", e)),
        };

        let filled = carried + n;
        let whole = filled - filled % KERNEL_RECORD_LEN;
        let records = KernelRecord::decode_all(&buf[..whole]);
        self.partial = buf[whole..filled].to_vec();
        if !self.partial.is_empty() {
            let held = self.partial.len();
            match self.mode {
                DeviceMode::Fifo => {
                    debug!(device = %self.path.display(), held, "holding partial record");
                },
                DeviceMode::Kernel => {
                    warn!(device = %self.path.display(), held, "short read, holding partial record");
                },
            }
        }
        if records.is_empty() {
            return Ok(Drained::default());
        }

        let software_overflow = match self.mode {
            DeviceMode::Fifo => false,
            DeviceMode::Kernel => self.overflow_reported(),
        };

        Ok(Drained {
            records,
            software_overflow,
        })
    }

    /// Query and clear the kernel overflow flag. A failed query is logged and
    /// reads as no overflow, so records already read are still delivered.
    fn overflow_reported(&self) -> bool {
        match self.take_flags() {
            Ok(flags) => flags & MCE_FLAG_OVERFLOW != 0,
            Err(e) => {
                error!("{e}");
                false
            },
        }
    }

    /// Query and clear the kernel's log flags.
    fn take_flags(&self) -> Result<libc::c_int, DeviceError> {
        let mut flags: libc::c_int = 0;
        // SAFETY: see `open`.
        let queried = unsafe { mce_getclear_flags(self.file.as_raw_fd(), &mut flags) };
        queried.map_err(|errno| DeviceError::io(&self.path, "ioctl(MCE_GETCLEAR_FLAGS)", errno.into()))?;
        Ok(flags)
    }

    /// One poll on the device alone. `Ok(None)` is a timeout.
    fn poll_once(&self, timeout: PollTimeout) -> Result<Option<PollFlags>, Errno> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        if poll(&mut fds, timeout)? == 0 {
            return Ok(None);
        }
        Ok(Some(fds[0].revents().unwrap_or_else(PollFlags::empty)))
    }

    /// Decide whether readiness notification on this device is trustworthy.
    ///
    /// Some kernels report the device readable when it is not. Only an actual
    /// zero-timeout expiry proves `poll()` works. When the device reports
    /// readiness the pending records are handed to `drain_and_dispatch` and
    /// the probe repeats; readiness with nothing to read means `poll()` is
    /// lying. The probe gives up after [`MAX_PROBE_ROUNDS`].
    pub fn detect_readiness_support<F>(&mut self, mut drain_and_dispatch: F) -> bool
    where
        F: FnMut(&mut Self) -> Result<usize, DeviceError>,
    {
        for round in 0..MAX_PROBE_ROUNDS {
            let revents = match self.poll_once(PollTimeout::ZERO) {
                Ok(None) => {
                    debug!(device = %self.path.display(), round, "poll() on device works");
                    return true;
                },
                Ok(Some(revents)) => revents,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(device = %self.path.display(), "poll(): {errno}");
                    return false;
                },
            };

            // A hung-up fifo writer is a genuine readiness report.
            let hung_up = self.is_fake() && revents.contains(PollFlags::POLLHUP);

            if revents.contains(PollFlags::POLLIN) {
                match drain_and_dispatch(self) {
                    Ok(n) if n > 0 => continue,
                    Ok(_) => return hung_up,
                    Err(e) => {
                        warn!(device = %self.path.display(), "drain during poll probe failed: {e}");
                        return false;
                    },
                }
            }
            if hung_up {
                return true;
            }
            warn!(device = %self.path.display(), "odd, poll set flags {revents:?}");
            return false;
        }

        warn!(
            device = %self.path.display(),
            rounds = MAX_PROBE_ROUNDS,
            "device kept reporting events during poll probe; not trusting poll()"
        );
        false
    }
}

impl AsFd for McelogDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mced_core::event::MCI_STATUS_OVER;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    use super::*;

    fn record(bank: u8, status: u64) -> KernelRecord {
        KernelRecord {
            bank,
            status,
            cpu: 1,
            ..KernelRecord::default()
        }
    }

    fn make_fifo(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("mcelog");
        mkfifo(&path, Mode::S_IRWXU).unwrap();
        path
    }

    /// Open the write side without blocking; the reader must already exist.
    fn open_writer(path: &Path) -> File {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .unwrap()
    }

    #[test]
    fn missing_device_is_not_found_and_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let mut failures = OpenFailureLog::default();

        let err = McelogDevice::open(&path, &mut failures).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
        assert!(failures.was_reported(OpenFailure::Stat));
        // The same cause is not reported again.
        assert!(!failures.first(OpenFailure::Stat));
        // A different cause still is.
        assert!(failures.first(OpenFailure::Open));
    }

    #[test]
    fn regular_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"not a device").unwrap();
        let mut failures = OpenFailureLog::default();

        let err = McelogDevice::open(&path, &mut failures).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { .. }));
        assert!(failures.was_reported(OpenFailure::RecordLenQuery));
    }

    #[test]
    fn fifo_opens_in_reduced_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut failures = OpenFailureLog::default();

        let device = McelogDevice::open(&path, &mut failures).unwrap();
        assert_eq!(device.mode(), DeviceMode::Fifo);
        assert!(failures.was_reported(OpenFailure::FakeDevice));
        assert_eq!(device.record_count().unwrap(), FIFO_BATCH_RECORDS);
    }

    #[test]
    fn fifo_drain_converts_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();

        let mut writer = open_writer(&path);
        // Nothing written yet: a transient empty result.
        assert!(device.drain().unwrap().is_empty());

        let mut payload = Vec::new();
        for bank in 0..3 {
            payload.extend_from_slice(&record(bank, 0).to_bytes());
        }
        writer.write_all(&payload).unwrap();

        let drained = device.drain().unwrap();
        assert_eq!(drained.len(), 3);
        assert!(!drained.software_overflow);
        let banks: Vec<u8> = drained.records.iter().map(|r| r.bank).collect();
        assert_eq!(banks, vec![0, 1, 2]);
        assert!(drained.records.iter().all(|r| r.cpu == 1));
    }

    #[test]
    fn fifo_partial_record_is_completed_by_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();
        let mut writer = open_writer(&path);

        let mut payload = Vec::new();
        for bank in 0..3 {
            payload.extend_from_slice(&record(bank, 0).to_bytes());
        }
        let split = KERNEL_RECORD_LEN + KERNEL_RECORD_LEN / 2;

        writer.write_all(&payload[..split]).unwrap();
        let first = device.drain().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.records[0].bank, 0);

        writer.write_all(&payload[split..]).unwrap();
        let rest = device.drain().unwrap();
        let banks: Vec<u8> = rest.records.iter().map(|r| r.bank).collect();
        assert_eq!(banks, vec![1, 2]);
        assert!(rest.records.iter().all(|r| r.cpu == 1));
    }

    #[test]
    fn kernel_ioctl_failure_is_not_a_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"not a device").unwrap();
        let file = File::open(&path).unwrap();
        let device = McelogDevice::from_open_file(file, &path, DeviceMode::Kernel);

        // The flag query fails on a plain file; no overflow is assumed.
        assert!(!device.overflow_reported());

        let err = device.record_count().unwrap_err();
        assert!(matches!(err, DeviceError::Io { .. }));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn disconnect_classification() {
        let path = Path::new("/dev/mcelog");
        let io_err = |code| DeviceError::io(path, "read", io::Error::from_raw_os_error(code));
        assert!(io_err(libc::EBADF).is_disconnect());
        assert!(io_err(libc::ENODEV).is_disconnect());
        assert!(!io_err(libc::EIO).is_disconnect());
        assert!(!io_err(libc::ENOTTY).is_disconnect());
        assert!(!DeviceError::Busy {
            path: path.to_path_buf()
        }
        .is_disconnect());
    }

    #[test]
    fn probe_trusts_idle_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();
        let _writer = open_writer(&path);

        let mut calls = 0;
        assert!(device.detect_readiness_support(|_| {
            calls += 1;
            Ok(0)
        }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn probe_drains_pending_records_then_trusts() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();
        let mut writer = open_writer(&path);
        writer
            .write_all(&record(2, MCI_STATUS_OVER).to_bytes())
            .unwrap();

        let mut seen = Vec::new();
        let supported = device.detect_readiness_support(|dev| {
            let drained = dev.drain()?;
            seen.extend(drained.records);
            Ok(seen.len())
        });
        assert!(supported);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, MCI_STATUS_OVER);
    }

    #[test]
    fn probe_gives_up_on_endless_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();
        let mut writer = open_writer(&path);
        writer.write_all(&record(0, 0).to_bytes()).unwrap();

        // Pretend every drain handled something without consuming the data.
        let mut calls = 0;
        let supported = device.detect_readiness_support(|_| {
            calls += 1;
            Ok(1)
        });
        assert!(!supported);
        assert_eq!(calls, MAX_PROBE_ROUNDS);
    }

    #[test]
    fn probe_rejects_readiness_without_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(&dir);
        let mut device = McelogDevice::open(&path, &mut OpenFailureLog::default()).unwrap();
        let mut writer = open_writer(&path);
        writer.write_all(&record(0, 0).to_bytes()).unwrap();

        // Readable, but the drain claims nothing was there.
        assert!(!device.detect_readiness_support(|_| Ok(0)));
    }
}
