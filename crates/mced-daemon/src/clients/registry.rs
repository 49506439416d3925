//! Connected client sessions.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use tracing::{debug, info, warn};

/// Registry-assigned session identifier. Never reused.
pub type ClientId = u64;

/// Kernel-reported identity of the process on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerIdentity {
    #[must_use]
    pub const fn new(pid: i32, uid: u32, gid: u32) -> Self {
        Self { pid, uid, gid }
    }

    /// Read `SO_PEERCRED` from a connected stream.
    pub fn from_stream(stream: &UnixStream) -> Result<Self, Errno> {
        let creds = getsockopt(stream, PeerCredentials)?;
        Ok(Self::new(creds.pid(), creds.uid(), creds.gid()))
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Formats as `pid[uid:gid]`.
impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.pid, self.uid, self.gid)
    }
}

/// One connected consumer.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    stream: UnixStream,
    peer: PeerIdentity,
    label: String,
    counts_against_quota: bool,
    dead: bool,
}

impl ClientSession {
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> PeerIdentity {
        self.peer
    }

    /// Human-readable `pid[uid:gid]` label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub const fn counts_against_quota(&self) -> bool {
        self.counts_against_quota
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Flag the session for removal on the next prune.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Write one complete line to the client.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.stream.write_all(&buf)
    }

    /// Check a readable or hung-up socket for end-of-stream. Clients are not
    /// expected to send anything; stray bytes are discarded.
    fn check_liveness(&mut self, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            self.dead = true;
            return;
        }
        if !revents.contains(PollFlags::POLLIN) {
            return;
        }
        let mut scratch = [0u8; 256];
        match self.stream.read(&mut scratch) {
            Ok(0) => self.dead = true,
            Ok(_) => {},
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {},
            Err(_) => self.dead = true,
        }
    }
}

impl AsFd for ClientSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Result of offering a connection to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(ClientId),
    /// The non-root quota is exhausted; the connection was closed.
    OverQuota,
}

/// Owner of every connected client session.
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: Vec<ClientSession>,
    next_id: ClientId,
    non_root_clients: usize,
    client_max: usize,
}

impl ClientRegistry {
    #[must_use]
    pub const fn new(client_max: usize) -> Self {
        Self {
            sessions: Vec::new(),
            next_id: 1,
            non_root_clients: 0,
            client_max,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that count against the quota.
    #[must_use]
    pub const fn non_root_clients(&self) -> usize {
        self.non_root_clients
    }

    #[must_use]
    pub const fn client_max(&self) -> usize {
        self.client_max
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.iter_mut()
    }

    /// Register a freshly accepted connection.
    ///
    /// Non-root peers are refused once `client_max` of them are connected.
    /// The stream is switched to non-blocking, close-on-exec before it is
    /// registered; failure to do so drops the connection and is returned.
    pub fn admit(&mut self, stream: UnixStream, peer: PeerIdentity) -> io::Result<Admission> {
        let counted = !peer.is_root();
        if counted && self.non_root_clients >= self.client_max {
            info!(
                client = %peer,
                client_max = self.client_max,
                "too many non-root clients"
            );
            return Ok(Admission::OverQuota);
        }

        stream.set_nonblocking(true)?;
        fcntl(stream.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        let id = self.next_id;
        self.next_id += 1;
        if counted {
            self.non_root_clients += 1;
        }
        self.sessions.push(ClientSession {
            id,
            stream,
            peer,
            label: peer.to_string(),
            counts_against_quota: counted,
            dead: false,
        });
        Ok(Admission::Admitted(id))
    }

    /// Remove a session, returning its quota slot.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientSession> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        let session = self.sessions.swap_remove(index);
        if session.counts_against_quota {
            self.non_root_clients -= 1;
        }
        Some(session)
    }

    /// Detect disconnected peers and drop them. Returns the removed ids.
    pub fn prune_dead(&mut self) -> Vec<ClientId> {
        if !self.sessions.is_empty() {
            let revents = {
                let mut fds: Vec<PollFd<'_>> = self
                    .sessions
                    .iter()
                    .map(|s| PollFd::new(s.stream.as_fd(), PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::ZERO) {
                    Ok(_) => fds
                        .iter()
                        .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                        .collect::<Vec<_>>(),
                    Err(errno) => {
                        warn!("poll() on client sockets failed: {errno}");
                        Vec::new()
                    },
                }
            };
            for (session, flags) in self.sessions.iter_mut().zip(revents) {
                session.check_liveness(flags);
            }
        }

        let dead: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|s| s.dead)
            .map(|s| s.id)
            .collect();
        for id in &dead {
            if let Some(session) = self.remove(*id) {
                info!(client = %session.label, "client disconnected");
            }
        }
        dead
    }

    /// Drop every session. Returns how many were connected.
    pub fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for session in self.sessions.drain(..) {
            debug!(client = %session.label, "closing client");
        }
        self.non_root_clients = 0;
        count
    }
}
