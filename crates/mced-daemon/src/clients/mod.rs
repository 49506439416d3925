//! Client connections.
//!
//! Consumers connect to a Unix-domain stream socket and receive one text line
//! per machine-check event. This module owns everything on the client side of
//! the daemon:
//!
//! - [`socket`]: binding the listening socket (stale-file removal, mode and
//!   group ownership)
//! - [`registry`]: the connected sessions, the non-root quota and dead-peer
//!   pruning
//! - [`admission`]: accepting one connection and the consecutive-failure
//!   breaker that stops an accept storm
//!
//! # Invariants
//!
//! - The non-root client count always equals the number of registered
//!   sessions whose peer uid is not 0.
//! - Root clients are never refused for quota reasons.
//! - Each session is removed from the registry at most once, and its count
//!   contribution is returned exactly then.

pub mod admission;
pub mod registry;
pub mod socket;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use admission::{accept_client, AcceptBreaker, AcceptOutcome, MAX_ACCEPT_FAILURES};
pub use registry::{Admission, ClientId, ClientRegistry, ClientSession, PeerIdentity};
pub use socket::{ClientSocket, ListenerConfig};

/// Errors raised while setting up the listening socket.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A non-socket file occupies the socket path.
    #[error("{} exists but is not a socket", path.display())]
    NotASocket { path: PathBuf },

    /// The configured socket group does not exist.
    #[error("unknown socket group {0:?}")]
    UnknownGroup(String),

    /// A filesystem or socket operation failed.
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
