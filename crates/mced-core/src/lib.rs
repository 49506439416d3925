//! mced-core - shared building blocks for the MCE daemon.
//!
//! This crate holds the pieces of the daemon that do not touch the operating
//! system directly: the kernel record format and the normalized event derived
//! from it, daemon configuration, and the timing primitives the event loop
//! uses to pace itself.
//!
//! # Modules
//!
//! - [`event`]: kernel `struct mce` wire format and [`NormalizedEvent`]
//! - [`config`]: [`MceDaemonConfig`] loaded from TOML with CLI overrides
//! - [`clock`]: monotonic time source and sleeper used by pacing
//! - [`rate_limit`]: re-armed gate used to throttle duplicate warnings
//! - [`pacing`]: per-event throughput ceiling with drift-correcting bias
//! - [`interval`]: adaptive poll timeout controller

pub mod clock;
pub mod config;
pub mod event;
pub mod interval;
pub mod pacing;
pub mod rate_limit;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MceDaemonConfig};
pub use event::{KernelRecord, NormalizedEvent, RecordDecodeError, KERNEL_RECORD_LEN};
pub use interval::PollInterval;
pub use pacing::EventPacer;
pub use rate_limit::{OverflowThrottle, RateGate};
