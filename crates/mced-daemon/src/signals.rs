//! Asynchronous lifecycle signals.
//!
//! Handlers do nothing but set a flag and write one byte into a self-pipe.
//! The read end of the pipe is part of the event loop's wait set, so a signal
//! arriving while the loop is blocked wakes it, and the loop then acts on the
//! flags at the top of its next iteration. No event processing, client I/O or
//! logging ever happens in signal context.
//!
//! | Signal | Meaning |
//! |--------|---------|
//! | `SIGHUP` | reload rule configuration |
//! | `SIGINT`, `SIGQUIT`, `SIGTERM` | clean shutdown |
//! | `SIGPIPE` | ignored; a vanished client surfaces as a write error |

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::SigId;
use tracing::debug;

/// Signals that request a clean shutdown.
pub const TERMINATE_SIGNALS: [i32; 3] = [SIGINT, SIGQUIT, SIGTERM];

/// A lifecycle request, whether delivered by the OS or raised in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Reload,
    Terminate(i32),
}

/// Requests observed since the last call to [`SignalChannel::take_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSignals {
    pub reload: bool,
    /// The terminating signal number, if one arrived.
    pub terminate: Option<i32>,
}

/// Signal flags plus the self-pipe that wakes the event loop.
#[derive(Debug)]
pub struct SignalChannel {
    reload: Arc<AtomicBool>,
    terminate: Arc<AtomicUsize>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    registered: Vec<SigId>,
}

impl SignalChannel {
    /// Create the channel without touching process signal dispositions.
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            reload: Arc::new(AtomicBool::new(false)),
            terminate: Arc::new(AtomicUsize::new(0)),
            wake_rx,
            wake_tx,
            registered: Vec::new(),
        })
    }

    /// Route the process's lifecycle signals into this channel.
    pub fn install(&mut self) -> io::Result<()> {
        // SAFETY: SIG_IGN installs no handler code; nothing runs in signal
        // context.
        #[allow(unsafe_code)]
        let ignored = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
        ignored.map_err(io::Error::from)?;

        self.registered.push(signal_hook::flag::register(
            SIGHUP,
            Arc::clone(&self.reload),
        )?);
        self.registered.push(signal_hook::low_level::pipe::register(
            SIGHUP,
            self.wake_tx.try_clone()?,
        )?);
        for sig in TERMINATE_SIGNALS {
            #[allow(clippy::cast_sign_loss)]
            let value = sig as usize;
            self.registered.push(signal_hook::flag::register_usize(
                sig,
                Arc::clone(&self.terminate),
                value,
            )?);
            self.registered.push(signal_hook::low_level::pipe::register(
                sig,
                self.wake_tx.try_clone()?,
            )?);
        }
        debug!(handlers = self.registered.len(), "signal handlers installed");
        Ok(())
    }

    /// Deliver a request in-process, exactly as a real signal would.
    pub fn raise(&self, request: LifecycleSignal) {
        match request {
            LifecycleSignal::Reload => self.reload.store(true, Ordering::SeqCst),
            LifecycleSignal::Terminate(sig) => {
                #[allow(clippy::cast_sign_loss)]
                self.terminate.store(sig as usize, Ordering::SeqCst);
            },
        }
        // A full pipe already guarantees a wakeup.
        let _ = (&self.wake_tx).write(&[1]);
    }

    /// Consume the pending flags.
    pub fn take_pending(&self) -> PendingSignals {
        let reload = self.reload.swap(false, Ordering::SeqCst);
        let terminate = match self.terminate.swap(0, Ordering::SeqCst) {
            0 => None,
            sig => i32::try_from(sig).ok(),
        };
        PendingSignals { reload, terminate }
    }

    /// Empty the self-pipe after it woke the loop.
    pub fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl AsFd for SignalChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
