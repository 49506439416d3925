//! Listening socket setup.
//!
//! # Setup Order
//!
//! 1. A stale socket file left by a previous run is removed. Any other kind
//!    of file at the path is an error.
//! 2. The socket is bound and made non-blocking.
//! 3. Permission bits are applied after binding.
//! 4. If a group is configured it is resolved by name and set as the socket
//!    file's group. An unknown group is fatal.
//!
//! The socket file is removed when the [`ClientSocket`] is dropped, including
//! when setup fails after the bind.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use mced_core::MceDaemonConfig;
use nix::unistd::{chown, Group};
use tracing::{debug, info, warn};

use super::ClientError;

/// Listening socket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub path: PathBuf,
    pub mode: u32,
    pub group: Option<String>,
}

impl ListenerConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: mced_core::config::DEFAULT_SOCKET_MODE,
            group: None,
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl From<&MceDaemonConfig> for ListenerConfig {
    fn from(config: &MceDaemonConfig) -> Self {
        Self {
            path: config.socket_file.clone(),
            mode: config.socket_mode,
            group: config.socket_group.clone(),
        }
    }
}

/// The bound client socket.
#[derive(Debug)]
pub struct ClientSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ClientSocket {
    pub fn bind(config: &ListenerConfig) -> Result<Self, ClientError> {
        Self::cleanup_socket(&config.path)?;

        let listener = UnixListener::bind(&config.path)
            .map_err(|e| ClientError::io("failed to bind", &config.path, e))?;
        let socket = Self {
            listener,
            path: config.path.clone(),
        };

        socket
            .listener
            .set_nonblocking(true)
            .map_err(|e| ClientError::io("failed to set O_NONBLOCK on", &socket.path, e))?;
        Self::set_socket_permissions(&socket.path, config.mode)?;
        if let Some(group) = &config.group {
            Self::set_socket_group(&socket.path, group)?;
        }

        info!(
            socket_path = %socket.path.display(),
            mode = format_args!("{:o}", config.mode),
            group = config.group.as_deref().unwrap_or("-"),
            "client socket bound"
        );
        Ok(socket)
    }

    /// Remove a leftover socket file. Refuses to touch anything else.
    fn cleanup_socket(path: &Path) -> Result<(), ClientError> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ClientError::io("failed to stat", path, e)),
        };
        if !metadata.file_type().is_socket() {
            return Err(ClientError::NotASocket {
                path: path.to_path_buf(),
            });
        }
        std::fs::remove_file(path)
            .map_err(|e| ClientError::io("failed to remove stale socket", path, e))?;
        debug!(path = %path.display(), "removed stale socket file");
        Ok(())
    }

    fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), ClientError> {
        std::fs::set_permissions(path, Permissions::from_mode(mode))
            .map_err(|e| ClientError::io("failed to set permissions on", path, e))
    }

    fn set_socket_group(path: &Path, name: &str) -> Result<(), ClientError> {
        let group = Group::from_name(name)
            .map_err(|errno| ClientError::io("failed to look up group for", path, errno.into()))?
            .ok_or_else(|| ClientError::UnknownGroup(name.to_string()))?;
        chown(path, None, Some(group.gid))
            .map_err(|errno| ClientError::io("failed to chown", path, errno.into()))
    }

    #[must_use]
    pub const fn listener(&self) -> &UnixListener {
        &self.listener
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file.
    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(socket_path = %self.path.display(), "removed client socket file");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("failed to remove client socket on drop: {e}");
        }
    }
}
