//! Disk probe: fill level of every real mounted filesystem.
//!
//! `statvfs` can hang indefinitely on a wedged mount (stale NFS, a stuck
//! FUSE daemon), so every call is wrapped in a three-second alarm. This
//! is the only permitted use of SIGALRM in the process: the guard saves
//! the previous handler and any pending alarm, and restores both with
//! the remaining time adjusted.

use crate::collect::read_mounts;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Priority, Result};
use regex::Regex;
use std::ffi::CString;
use std::time::Instant;
use tracing::{debug, warn};

/// Seconds a single statvfs call may take before it is abandoned.
const STATVFS_TIMEOUT: u32 = 3;

/// Partitions whose fill level is never reported as an error.
static BUILTIN_IGNORE: once_cell::sync::Lazy<Vec<Regex>> = once_cell::sync::Lazy::new(|| {
    vec![Regex::new("^/snap/core/").expect("builtin pattern is valid")]
});

pub struct DiskProbe;

impl DiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiskProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for DiskProbe {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("disk");

        let ignore_patterns = user_ignore_patterns(
            &host.get_config("disk-ignore").unwrap_or_default(),
        );

        for mount in read_mounts() {
            let Some(space) = statvfs_guarded(&mount.dir, STATVFS_TIMEOUT) else {
                // wedged or vanished mount; no partition data this run
                debug!(dir = %mount.dir, "statvfs timed out or failed, skipping mount");
                continue;
            };

            // zero-block entries are virtual filesystems
            if space.blocks == 0 {
                continue;
            }

            let p = host.doc().push(&e.key("partition"));
            host.doc().set(&p.key("dir"), mount.dir.as_str());
            host.doc().set(&p.key("blocks"), space.blocks * space.frsize / 1024);
            host.doc().set(&p.key("bfree"), space.bfree * space.frsize / 1024);
            host.doc().set(&p.key("available"), space.bavail * space.frsize / 1024);
            host.doc().set(&p.key("ffree"), space.ffree);
            host.doc().set(&p.key("favailable"), space.favail);
            host.doc().set(&p.key("flags"), space.flags);

            let usage = 1.0 - space.bavail as f64 / space.blocks as f64;
            if usage >= 0.9 {
                let builtin_ignored =
                    BUILTIN_IGNORE.iter().any(|re| re.is_match(&mount.dir));

                // the partition is marked as quite full either way
                host.doc().set(
                    &p.key("error"),
                    if builtin_ignored {
                        "partition used over 90% (ignore)"
                    } else {
                        "partition used over 90%"
                    },
                );

                if !builtin_ignored
                    && !ignore_patterns.iter().any(|re| re.is_match(&mount.dir))
                {
                    let hostname = host.state().hostname.clone();
                    host.append_error(
                        &e,
                        "disk",
                        &format!(
                            "partition \"{}\" on \"{hostname}\" is close to full ({:.1}%)",
                            mount.dir,
                            usage * 100.0
                        ),
                        fill_priority(usage),
                    )?;
                }
            }
        }

        Ok(())
    }
}

/// Error priority as a partition fills up.
fn fill_priority(usage: f64) -> Priority {
    if usage >= 0.999 {
        100
    } else if usage >= 0.95 {
        80
    } else {
        55 // [0.9, 0.95)
    }
}

/// Compile the administrator's colon-separated ignore regexes, dropping
/// anything that fails to compile with a warning.
fn user_ignore_patterns(raw: &str) -> Vec<Regex> {
    raw.split(':')
        .filter(|pattern| !pattern.is_empty())
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern, "invalid disk-ignore pattern skipped: {e}");
                None
            }
        })
        .collect()
}

/// Filesystem space figures, frsize-scaled by the caller.
#[derive(Debug, Clone, Copy, Default)]
struct DiskSpace {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    ffree: u64,
    favail: u64,
    flags: u64,
    frsize: u64,
}

extern "C" fn statvfs_alarm_handler(_sig: libc::c_int) {
    // nothing to do: the point is interrupting statvfs with EINTR
}

/// `statvfs` bounded by an alarm.
///
/// The handler is installed without SA_RESTART so the blocked syscall
/// returns EINTR instead of being restarted. Any previously pending
/// alarm is re-armed afterwards with the elapsed time subtracted.
fn statvfs_guarded(path: &str, seconds: u32) -> Option<DiskSpace> {
    let c_path = CString::new(path).ok()?;

    // SAFETY: plain sigaction bookkeeping; the handler does nothing and
    // both structs are fully initialized before use.
    unsafe {
        let mut alarm_action: libc::sigaction = std::mem::zeroed();
        let mut saved_action: libc::sigaction = std::mem::zeroed();
        alarm_action.sa_flags = 0; // no SA_RESTART
        libc::sigemptyset(&mut alarm_action.sa_mask);
        let handler: extern "C" fn(libc::c_int) = statvfs_alarm_handler;
        alarm_action.sa_sigaction = handler as usize;

        if libc::sigaction(libc::SIGALRM, &alarm_action, &mut saved_action) != 0 {
            return None;
        }

        let previous_alarm = libc::alarm(seconds);
        let started = Instant::now();

        let mut stats: libc::statvfs = std::mem::zeroed();
        let rc = libc::statvfs(c_path.as_ptr(), &mut stats);

        // cancel our alarm before restoring the handler
        libc::alarm(0);
        libc::sigaction(libc::SIGALRM, &saved_action, std::ptr::null_mut());

        // re-arm whoever had an alarm pending, minus the time we used
        if previous_alarm != 0 {
            let elapsed = started.elapsed().as_secs() as u32;
            let remaining = if elapsed >= previous_alarm {
                1
            } else {
                previous_alarm - elapsed
            };
            libc::alarm(remaining);
        }

        if rc != 0 {
            return None;
        }

        Some(DiskSpace {
            blocks: stats.f_blocks as u64,
            bfree: stats.f_bfree as u64,
            bavail: stats.f_bavail as u64,
            ffree: stats.f_ffree as u64,
            favail: stats.f_favail as u64,
            flags: stats.f_flag as u64,
            frsize: stats.f_frsize as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_priority_tiers() {
        assert_eq!(fill_priority(0.90), 55);
        assert_eq!(fill_priority(0.949), 55);
        assert_eq!(fill_priority(0.95), 80);
        assert_eq!(fill_priority(0.998), 80);
        assert_eq!(fill_priority(0.999), 100);
        assert_eq!(fill_priority(1.0), 100);
    }

    #[test]
    fn test_user_ignore_patterns() {
        let patterns = user_ignore_patterns("^/mnt/backup:^/media/");
        assert_eq!(patterns.len(), 2);
        assert!(patterns[0].is_match("/mnt/backup"));
        assert!(patterns[1].is_match("/media/usb0"));
        assert!(!patterns.iter().any(|re| re.is_match("/home")));

        // invalid patterns are dropped, valid ones kept
        let patterns = user_ignore_patterns("([:^/ok");
        assert_eq!(patterns.len(), 1);

        assert!(user_ignore_patterns("").is_empty());
    }

    #[test]
    fn test_builtin_ignore_matches_snap_core() {
        assert!(BUILTIN_IGNORE.iter().any(|re| re.is_match("/snap/core/12345")));
        assert!(!BUILTIN_IGNORE.iter().any(|re| re.is_match("/home")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_statvfs_guarded_on_root() {
        let space = statvfs_guarded("/", STATVFS_TIMEOUT).expect("statvfs on / works");
        assert!(space.blocks > 0);
        assert!(space.frsize > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_statvfs_guarded_missing_path() {
        assert!(statvfs_guarded("/definitely/not/a/mount", STATVFS_TIMEOUT).is_none());
    }
}
