//! Configuration parsing and management.
//!
//! The daemon reads an optional TOML file; every command-line flag then
//! overrides the corresponding file value. A missing file means built-in
//! defaults.
//!
//! ```toml
//! device = "/dev/mcelog"
//! confdir = "/etc/mced"
//! socket_file = "/var/run/mced.socket"
//! socket_mode = 0o660
//! socket_group = "adm"
//! client_max = 64
//! max_interval_ms = 5000
//! min_interval_ms = 100
//! rate_limit = 200
//! retry_device = true
//! db_dir = "/var/lib/mced"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default kernel event device.
pub const DEFAULT_DEVICE: &str = "/dev/mcelog";
/// Default rule configuration directory.
pub const DEFAULT_CONFDIR: &str = "/etc/mced";
/// Default listening socket path.
pub const DEFAULT_SOCKET_FILE: &str = "/var/run/mced.socket";
/// Default listening socket permissions.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;
/// Default pid file path.
pub const DEFAULT_PID_FILE: &str = "/var/run/mced.pid";
/// Default ceiling on simultaneously connected non-root clients.
pub const DEFAULT_CLIENT_MAX: usize = 256;
/// Default upper bound of the adaptive poll interval.
pub const DEFAULT_MAX_INTERVAL_MS: i64 = 5000;
/// Default lower bound of the adaptive poll interval.
pub const DEFAULT_MIN_INTERVAL_MS: i64 = 100;
/// Default location of the optional TOML file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/mced/mced.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML was invalid.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MceDaemonConfig {
    /// Boot-session identifier stamped on every event.
    #[serde(default = "default_boot")]
    pub boot: i64,

    /// Rule configuration directory handed to the rule engine.
    #[serde(default = "default_confdir")]
    pub confdir: PathBuf,

    /// Ceiling on simultaneously connected non-root clients.
    #[serde(default = "default_client_max")]
    pub client_max: usize,

    /// Kernel event device (or a FIFO for testing).
    #[serde(default = "default_device")]
    pub device: PathBuf,

    /// Log every event and every overflow.
    #[serde(default)]
    pub log_events: bool,

    /// Listening socket path.
    #[serde(default = "default_socket_file")]
    pub socket_file: PathBuf,

    /// Listening socket permission bits.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Group owning the listening socket.
    #[serde(default)]
    pub socket_group: Option<String>,

    /// Do not listen for clients at all.
    #[serde(default)]
    pub no_socket: bool,

    /// Upper bound of the poll interval; `<= 0` disables interval polling.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: i64,

    /// Lower bound of the poll interval; `<= 0` means no floor.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: i64,

    /// Maximum events handled per second; `<= 0` disables pacing.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,

    /// Keep retrying the device instead of exiting when it cannot be opened.
    #[serde(default)]
    pub retry_device: bool,

    /// Pid file path.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Event store directory. The store is disabled when unset.
    #[serde(default)]
    pub db_dir: Option<PathBuf>,
}

const fn default_boot() -> i64 {
    -1
}

fn default_confdir() -> PathBuf {
    PathBuf::from(DEFAULT_CONFDIR)
}

const fn default_client_max() -> usize {
    DEFAULT_CLIENT_MAX
}

fn default_device() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE)
}

fn default_socket_file() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_FILE)
}

const fn default_socket_mode() -> u32 {
    DEFAULT_SOCKET_MODE
}

const fn default_max_interval_ms() -> i64 {
    DEFAULT_MAX_INTERVAL_MS
}

const fn default_min_interval_ms() -> i64 {
    DEFAULT_MIN_INTERVAL_MS
}

const fn default_rate_limit() -> i64 {
    -1
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}

impl Default for MceDaemonConfig {
    fn default() -> Self {
        Self {
            boot: default_boot(),
            confdir: default_confdir(),
            client_max: default_client_max(),
            device: default_device(),
            log_events: false,
            socket_file: default_socket_file(),
            socket_mode: default_socket_mode(),
            socket_group: None,
            no_socket: false,
            max_interval_ms: default_max_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            rate_limit: default_rate_limit(),
            retry_device: false,
            pid_file: default_pid_file(),
            db_dir: None,
        }
    }
}

impl MceDaemonConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and normalize configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.normalized()
    }

    /// Clamp sentinel values and check consistency.
    ///
    /// - `max_interval_ms <= 0` becomes `-1` (interval polling disabled)
    /// - `min_interval_ms <= 0` becomes `0` (no floor)
    /// - a positive minimum above a positive maximum is rejected
    /// - socket modes outside `0o7777` are rejected
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        if self.max_interval_ms <= 0 {
            self.max_interval_ms = -1;
        }
        if self.min_interval_ms <= 0 {
            self.min_interval_ms = 0;
        }
        if self.max_interval_ms > 0 && self.min_interval_ms > self.max_interval_ms {
            return Err(ConfigError::Validation(format!(
                "min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if self.socket_mode > 0o7777 {
            return Err(ConfigError::Validation(format!(
                "socket_mode {:o} is not a permission mode",
                self.socket_mode
            )));
        }
        Ok(self)
    }

    /// Whether the listening socket is enabled.
    #[must_use]
    pub const fn socket_enabled(&self) -> bool {
        !self.no_socket
    }
}

/// Parse an octal permission string such as `0660` or `660`.
pub fn parse_octal_mode(text: &str) -> Result<u32, ConfigError> {
    let digits = text.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|e| ConfigError::Validation(format!("invalid socket mode {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = MceDaemonConfig::from_toml("").unwrap();
        assert_eq!(config, MceDaemonConfig::default());
        assert_eq!(config.device, PathBuf::from(DEFAULT_DEVICE));
        assert_eq!(config.client_max, DEFAULT_CLIENT_MAX);
        assert_eq!(config.rate_limit, -1);
        assert!(config.socket_enabled());
    }

    #[test]
    fn parses_full_file() {
        let config = MceDaemonConfig::from_toml(
            r#"
            boot = 12
            device = "/tmp/fake-mcelog"
            confdir = "/tmp/conf"
            socket_file = "/tmp/mced.sock"
            socket_mode = 0o660
            socket_group = "adm"
            client_max = 4
            max_interval_ms = 2000
            min_interval_ms = 50
            rate_limit = 10
            retry_device = true
            log_events = true
            db_dir = "/var/lib/mced"
            "#,
        )
        .unwrap();
        assert_eq!(config.boot, 12);
        assert_eq!(config.socket_mode, 0o660);
        assert_eq!(config.socket_group.as_deref(), Some("adm"));
        assert_eq!(config.client_max, 4);
        assert_eq!(config.rate_limit, 10);
        assert!(config.retry_device);
        assert!(config.log_events);
        assert_eq!(config.db_dir, Some(PathBuf::from("/var/lib/mced")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            MceDaemonConfig::from_toml("sockt_file = \"/x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn interval_sentinels_are_normalized() {
        let config =
            MceDaemonConfig::from_toml("max_interval_ms = 0\nmin_interval_ms = -5").unwrap();
        assert_eq!(config.max_interval_ms, -1);
        assert_eq!(config.min_interval_ms, 0);
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = MceDaemonConfig::from_toml("max_interval_ms = 100\nmin_interval_ms = 200")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MceDaemonConfig::from_file_or_default(&dir.path().join("absent.toml"))
            .unwrap();
        assert_eq!(config, MceDaemonConfig::default());
    }

    #[test]
    fn file_is_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mced.toml");
        std::fs::write(&path, "client_max = 3\nno_socket = true\n").unwrap();
        let config = MceDaemonConfig::from_file_or_default(&path).unwrap();
        assert_eq!(config.client_max, 3);
        assert!(!config.socket_enabled());
    }

    #[test]
    fn octal_modes_parse() {
        assert_eq!(parse_octal_mode("0660").unwrap(), 0o660);
        assert_eq!(parse_octal_mode("600").unwrap(), 0o600);
        assert_eq!(parse_octal_mode("0o644").unwrap(), 0o644);
        assert!(parse_octal_mode("0999").is_err());
    }
}
