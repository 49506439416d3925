//! Accepting client connections.
//!
//! A listening socket that fails `accept()` over and over indicates something
//! badly wrong (descriptor exhaustion, a broken socket). [`AcceptBreaker`]
//! counts consecutive failures; the event loop shuts the daemon down once it
//! trips. Any successful accept resets the streak. A connection refused for
//! quota reasons is a successful accept.

use std::io;
use std::os::unix::net::UnixListener;

use tracing::{error, info};

use super::registry::{Admission, ClientId, ClientRegistry, PeerIdentity};

/// Consecutive accept failures tolerated before giving up.
pub const MAX_ACCEPT_FAILURES: u32 = 5;

/// Consecutive-failure counter for `accept()`.
#[derive(Debug, Clone)]
pub struct AcceptBreaker {
    consecutive: u32,
    threshold: u32,
}

impl Default for AcceptBreaker {
    fn default() -> Self {
        Self::new(MAX_ACCEPT_FAILURES)
    }
}

impl AcceptBreaker {
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Count one failure. Returns `true` once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }

    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// What happened when the listener was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A new session was registered.
    Admitted(ClientId),
    /// The connection was accepted and then closed (quota or socket setup).
    Rejected,
    /// Nothing was pending after all.
    NotReady,
    /// `accept()` or the credential lookup failed.
    Failed { tripped: bool },
}

/// Accept one pending connection and offer it to the registry.
pub fn accept_client(
    listener: &UnixListener,
    registry: &mut ClientRegistry,
    breaker: &mut AcceptBreaker,
) -> AcceptOutcome {
    let stream = match listener.accept() {
        Ok((stream, _addr)) => stream,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            return AcceptOutcome::NotReady;
        },
        Err(e) => {
            error!("accept() on client socket failed: {e}");
            return AcceptOutcome::Failed {
                tripped: breaker.record_failure(),
            };
        },
    };

    let peer = match PeerIdentity::from_stream(&stream) {
        Ok(peer) => peer,
        Err(errno) => {
            error!("can't read client credentials: {errno}");
            return AcceptOutcome::Failed {
                tripped: breaker.record_failure(),
            };
        },
    };
    breaker.record_success();

    match registry.admit(stream, peer) {
        Ok(Admission::Admitted(id)) => {
            info!(client = %peer, "client connected");
            AcceptOutcome::Admitted(id)
        },
        Ok(Admission::OverQuota) => AcceptOutcome::Rejected,
        Err(e) => {
            error!(client = %peer, "can't configure client socket: {e}");
            AcceptOutcome::Rejected
        },
    }
}
