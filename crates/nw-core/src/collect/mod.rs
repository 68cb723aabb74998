//! Readers for the kernel's process pseudo-filesystem.
//!
//! # Files Parsed
//! - `/proc/uptime`, `/proc/loadavg`, `/proc/stat`, `/proc/vmstat`,
//!   `/proc/meminfo`: system-wide counters ([`sys`])
//! - `/proc/mounts`: mounted filesystems ([`mounts`])
//! - `/proc/<pid>/stat` and `cmdline`: per-process information
//!   ([`process_list`])
//!
//! Every parser is total over malformed input: unknown lines are skipped
//! and missing fields default, so a probe never fails just because a
//! kernel added a column.

pub mod mounts;
pub mod process_list;
pub mod sys;

pub use mounts::{read_mounts, MountEntry};
pub use process_list::{ProcessInfo, ProcessList};
pub use sys::{read_meminfo, MemInfo, SysStats};
