//! mced - Machine Check Exception daemon.
//!
//! Reads hardware error records from `/dev/mcelog`, hands each one to the
//! rule engine and streams it to connected clients over a Unix socket.
//!
//! # Startup
//!
//! 1. Parse arguments and merge them over the TOML configuration file.
//! 2. Bind the client socket while still attached to the terminal, so that
//!    bind and group errors are visible to whoever started the daemon.
//! 3. Daemonize (double fork, `setsid`, `umask(0)`, `chdir("/")`) unless
//!    running in the foreground. Nothing has spawned a thread at this point.
//! 4. Initialize logging, open the event store and install signal handlers.
//! 5. Load rules, open the device, write the pid file and enter the loop.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use mced_core::config::{parse_octal_mode, DEFAULT_CONFIG_FILE};
use mced_core::MceDaemonConfig;
use mced_daemon::clients::{ClientSocket, ListenerConfig};
use mced_daemon::lifecycle::Daemon;
use mced_daemon::rules::ClientBroadcast;
use mced_daemon::signals::SignalChannel;
use mced_daemon::store::{EventStore, JsonlEventStore, NullEventStore};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// mced - Machine Check Exception daemon
#[derive(Parser, Debug)]
#[allow(clippy::struct_excessive_bools)]
#[command(name = "mced")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Set the database directory
    #[arg(short = 'B', long)]
    dbdir: Option<PathBuf>,

    /// Set the current boot number
    #[arg(short = 'b', long, allow_negative_numbers = true)]
    bootnum: Option<i64>,

    /// Set the configuration directory
    #[arg(short = 'c', long)]
    confdir: Option<PathBuf>,

    /// Set the limit on non-root socket connections
    #[arg(short = 'C', long)]
    clientmax: Option<usize>,

    /// Increase debugging level (implies --foreground)
    #[arg(short = 'd', long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Use the specified mcelog device
    #[arg(short = 'D', long)]
    device: Option<PathBuf>,

    /// Run in the foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Set the group on the socket file
    #[arg(short = 'g', long)]
    socketgroup: Option<String>,

    /// Log each MCE and handlers
    #[arg(short = 'l', long)]
    logevents: bool,

    /// Set the permissions on the socket file (octal)
    #[arg(short = 'm', long)]
    socketmode: Option<String>,

    /// Set the MCE polling min interval (msecs)
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    mininterval: Option<i64>,

    /// Use the specified PID file
    #[arg(short = 'p', long)]
    pidfile: Option<PathBuf>,

    /// Limit the number of MCEs handled per second
    #[arg(short = 'r', long, allow_negative_numbers = true)]
    ratelimit: Option<i64>,

    /// Retry the mcelog device if it fails to open
    #[arg(short = 'R', long)]
    retrydev: bool,

    /// Use the specified socket file
    #[arg(short = 's', long)]
    socketfile: Option<PathBuf>,

    /// Do not listen on a UNIX socket (overrides --socketfile)
    #[arg(short = 'S', long)]
    nosocket: bool,

    /// Set the MCE polling max interval (msecs)
    #[arg(short = 'x', long, allow_negative_numbers = true)]
    maxinterval: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    const fn foreground(&self) -> bool {
        self.foreground || self.debug > 0
    }

    /// Filter directive: `--debug` raises the level past `--log-level`.
    fn log_filter(&self) -> String {
        match self.debug {
            0 => self.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Merge the configuration file with command-line overrides.
fn load_config(args: &Args) -> Result<MceDaemonConfig> {
    let mut config =
        MceDaemonConfig::from_file_or_default(&args.config).context("failed to load configuration")?;

    if let Some(dbdir) = &args.dbdir {
        config.db_dir = Some(dbdir.clone());
    }
    if let Some(bootnum) = args.bootnum {
        config.boot = bootnum;
    }
    if let Some(confdir) = &args.confdir {
        config.confdir.clone_from(confdir);
    }
    if let Some(clientmax) = args.clientmax {
        config.client_max = clientmax;
    }
    if let Some(device) = &args.device {
        config.device.clone_from(device);
    }
    if let Some(group) = &args.socketgroup {
        config.socket_group = Some(group.clone());
    }
    if let Some(mode) = &args.socketmode {
        config.socket_mode = parse_octal_mode(mode)?;
    }
    if let Some(min) = args.mininterval {
        config.min_interval_ms = min;
    }
    if let Some(max) = args.maxinterval {
        config.max_interval_ms = max;
    }
    if let Some(pidfile) = &args.pidfile {
        config.pid_file.clone_from(pidfile);
    }
    if let Some(rate) = args.ratelimit {
        config.rate_limit = rate;
    }
    if let Some(socketfile) = &args.socketfile {
        config.socket_file.clone_from(socketfile);
    }
    config.log_events |= args.logevents;
    config.retry_device |= args.retrydev;
    config.no_socket |= args.nosocket;

    config.normalized().context("invalid configuration")
}

/// Detach from the controlling terminal.
///
/// Must run before anything spawns a thread.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    use nix::sys::stat::{umask, Mode};
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: the process is single-threaded here; the parent exits at once.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid().context("setsid failed")?;

    // SAFETY: still single-threaded; the session leader exits at once so the
    // daemon can never reacquire a controlling terminal.
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    umask(Mode::empty());
    std::env::set_current_dir("/").context("chdir / failed")?;
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(args.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn open_store(config: &MceDaemonConfig) -> Result<Box<dyn EventStore>> {
    Ok(match &config.db_dir {
        Some(dir) => Box::new(JsonlEventStore::open(dir).context("failed to open event store")?),
        None => Box::new(NullEventStore::default()),
    })
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let socket = if config.socket_enabled() {
        Some(
            ClientSocket::bind(&ListenerConfig::from(&config))
                .context("failed to set up the client socket")?,
        )
    } else {
        None
    };

    if !args.foreground() {
        if let Err(e) = daemonize() {
            eprintln!("daemonization failed: {e:#}");
            return Err(e);
        }
    }

    init_logging(&args)?;
    info!(version = env!("CARGO_PKG_VERSION"), foreground = args.foreground(), "starting");

    let store = open_store(&config)?;
    let mut signals = SignalChannel::new().context("failed to create signal channel")?;
    signals
        .install()
        .context("failed to install signal handlers")?;

    let pid_file = config.pid_file.clone();
    let mut daemon = Daemon::new(config, signals, Box::new(ClientBroadcast::new()), store)
        .with_pid_file(pid_file);
    if let Some(socket) = socket {
        daemon = daemon.with_socket(socket);
    }

    daemon.start().context("startup failed")?;
    let reason = daemon.run();
    Ok(ExitCode::from(reason.exit_code()))
}
