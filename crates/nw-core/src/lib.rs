//! NodeWatch core: the probe engine and the daemon around it.
//!
//! The moving parts, in dependency order:
//!
//! - [`collect`]: readers for the kernel's process pseudo-filesystem.
//! - [`host`]: the narrow service handle probes call into.
//! - [`registry`]: probe discovery, ordering, and ownership.
//! - [`probes`]: the builtin probe set.
//! - [`worker`]: the dedicated thread that drives probes on ticks.
//! - [`report`] / [`email`]: the throttled reporting gate.
//! - [`bus`]: the message-endpoint interface to the cluster bus.
//! - [`scheduler`]: the main-thread tick timer.
//! - [`server`]: the lifecycle controller owning the main loop.

pub mod bus;
pub mod collect;
pub mod email;
pub mod exit_codes;
pub mod host;
pub mod logging;
pub mod probes;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod worker;

/// Version tag attached to reports and script output headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used for bus registration and report subjects.
pub const SERVICE_NAME: &str = "nodewatch";

/// Current time as epoch seconds.
pub(crate) fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
