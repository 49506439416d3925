//! Rule engine seam.
//!
//! The daemon hands every event to a [`RuleEngine`], which decides what to do
//! with it: run handlers, notify connected clients, or both. The engine also
//! learns about every admitted client and is reloaded on `SIGHUP`.
//!
//! [`ClientBroadcast`] is the built-in engine. It validates the rule
//! directory, remembers which `*.conf` files it found, and writes every event
//! as one text line to each client it knows about.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use mced_core::NormalizedEvent;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, ClientRegistry, ClientSession};

/// Rule loading errors.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to read rule directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The interface between the event loop and rule evaluation.
pub trait RuleEngine {
    /// Load rules from `confdir`. Returns the number of rules loaded.
    fn load(&mut self, confdir: &Path) -> Result<usize, RuleError>;

    /// Discard loaded rules. With `preserve_runtime_state` the engine keeps
    /// its knowledge of connected clients so a reload is invisible to them.
    fn unload(&mut self, preserve_runtime_state: bool);

    /// Handle one event. Clients the engine fails to write to are marked
    /// dead in `clients`.
    fn dispatch(&mut self, event: &NormalizedEvent, clients: &mut ClientRegistry);

    /// A client was admitted.
    fn register_client(&mut self, session: &ClientSession);

    /// A client left the registry.
    fn unregister_client(&mut self, id: ClientId);
}

/// Line-per-event broadcast to every registered client.
#[derive(Debug, Default)]
pub struct ClientBroadcast {
    rule_files: Vec<PathBuf>,
    subscribers: BTreeSet<ClientId>,
}

impl ClientBroadcast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rule_files(&self) -> &[PathBuf] {
        &self.rule_files
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl RuleEngine for ClientBroadcast {
    fn load(&mut self, confdir: &Path) -> Result<usize, RuleError> {
        let io_err = |source| RuleError::Io {
            path: confdir.to_path_buf(),
            source,
        };
        let metadata = std::fs::metadata(confdir).map_err(io_err)?;
        if !metadata.is_dir() {
            return Err(RuleError::NotADirectory {
                path: confdir.to_path_buf(),
            });
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(confdir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
                files.push(path);
            }
        }
        files.sort();

        info!(confdir = %confdir.display(), rules = files.len(), "rules loaded");
        self.rule_files = files;
        Ok(self.rule_files.len())
    }

    fn unload(&mut self, preserve_runtime_state: bool) {
        self.rule_files.clear();
        if !preserve_runtime_state {
            self.subscribers.clear();
        }
    }

    fn dispatch(&mut self, event: &NormalizedEvent, clients: &mut ClientRegistry) {
        let line = event.to_string();
        for session in clients.iter_mut() {
            if session.is_dead() || !self.subscribers.contains(&session.id()) {
                continue;
            }
            match session.send_line(&line) {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!(client = session.label(), "client not keeping up, event skipped");
                },
                Err(e) => {
                    debug!(client = session.label(), "write to client failed: {e}");
                    session.mark_dead();
                    self.subscribers.remove(&session.id());
                },
            }
        }
    }

    fn register_client(&mut self, session: &ClientSession) {
        self.subscribers.insert(session.id());
    }

    fn unregister_client(&mut self, id: ClientId) {
        self.subscribers.remove(&id);
    }
}
