//! mced-daemon - the Machine Check Exception daemon.
//!
//! The daemon reads hardware machine-check records from the kernel's
//! `/dev/mcelog` character device (or from a named pipe standing in for it),
//! paces and records each event, hands it to the rule engine and streams it
//! to clients connected on a Unix-domain socket.
//!
//! The whole daemon runs on one thread. Signal handlers only set flags and
//! write to a self-pipe; everything else happens in [`lifecycle::Daemon`]'s
//! event loop.
//!
//! # Modules
//!
//! - [`device`]: opening, probing and draining the event device
//! - [`events`]: per-event pacing, overflow reporting, storage and dispatch
//! - [`clients`]: the listening socket, client sessions and admission
//! - [`rules`]: the rule engine seam and the built-in client broadcast
//! - [`store`]: the event store seam and its JSON-lines implementation
//! - [`signals`]: lifecycle signals delivered to the loop
//! - [`state`]: mutable loop state and run statistics
//! - [`pidfile`]: the pid file
//! - [`lifecycle`]: startup, the event loop and shutdown

pub mod clients;
pub mod device;
pub mod events;
pub mod lifecycle;
pub mod pidfile;
pub mod rules;
pub mod signals;
pub mod state;
pub mod store;

pub use device::{DeviceError, McelogDevice};
pub use lifecycle::{Daemon, DaemonError, ShutdownReason};
pub use rules::{ClientBroadcast, RuleEngine};
pub use signals::{LifecycleSignal, SignalChannel};
pub use store::{EventStore, JsonlEventStore, NullEventStore};
