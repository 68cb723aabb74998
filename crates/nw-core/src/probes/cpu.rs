//! CPU probe: load, jiffy counters, paging activity, and sustained
//! high-load detection.
//!
//! A load spike is only a warning; the probe memoizes when the load
//! first crossed the ceiling in a small cache file and escalates to a
//! priority-100 error once the condition has held for fifteen minutes.
//! The file is removed as soon as the load drops, which resets the
//! clock.

use crate::collect::SysStats;
use crate::epoch_now;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Result};
use tracing::error;

/// How long the load may stay above the ceiling before it is an error.
const HIGH_LOAD_GRACE: i64 = 15 * 60;

const HIGH_CPU_FILE: &str = "high_cpu_usage.txt";

pub struct CpuProbe;

impl CpuProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for CpuProbe {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("cpu");
        let mut stats = SysStats::new();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        host.doc().set(&e.key("count"), cpu_count as i64);
        host.doc().set(&e.key("freq"), clock_ticks());

        host.doc().set(&e.key("uptime"), stats.uptime());
        host.doc().set(&e.key("idle"), stats.idle());

        let avg1 = stats.load_avg1();
        host.doc().set(&e.key("avg1"), avg1);
        host.doc().set(&e.key("avg5"), stats.load_avg5());
        host.doc().set(&e.key("avg15"), stats.load_avg15());

        if avg1 >= load_ceiling(cpu_count) {
            let now = epoch_now();
            let mut add_warning = true;
            if let Some(path) = host.cache_path(HIGH_CPU_FILE) {
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        if let Ok(since) = content.trim().parse::<i64>() {
                            if now - since > HIGH_LOAD_GRACE {
                                // overloaded for a while now
                                host.append_error(&NodePath::root(), "cpu", "High CPU usage.", 100)?;
                                add_warning = false;
                            }
                        }
                    }
                    Err(_) => {
                        // first breach: start the clock
                        if let Err(e) = std::fs::write(&path, now.to_string()) {
                            error!(path = %path.display(),
                                "could not save the high load start date: {e}");
                        }
                    }
                }
            }
            if add_warning {
                host.doc().set(&e.key("warning"), "High CPU usage");
            }
        } else if let Some(path) = host.cache_path(HIGH_CPU_FILE) {
            // load is fine again, reset the clock
            let _ = std::fs::remove_file(path);
        }

        let cpu = stats.cpu_times();
        host.doc().set(&e.key("total_cpu_user"), cpu.user + cpu.nice);
        host.doc().set(&e.key("total_cpu_system"), cpu.system);
        host.doc().set(&e.key("total_cpu_wait"), cpu.idle + cpu.iowait);
        host.doc().set(&e.key("time_of_boot"), stats.boot_time());

        host.doc().set(&e.key("total_processes"), stats.processes());
        if stats.procs_running() > 1 {
            host.doc().set(&e.key("processes_running"), stats.procs_running());
        }
        if stats.procs_blocked() != 0 {
            host.doc().set(&e.key("processes_blocked"), stats.procs_blocked());
        }

        host.doc().set(&e.key("page_cache_in"), stats.page_in());
        host.doc().set(&e.key("page_cache_out"), stats.page_out());
        host.doc().set(&e.key("swap_cache_in"), stats.swap_in());
        host.doc().set(&e.key("swap_cache_out"), stats.swap_out());

        Ok(())
    }
}

/// Load-average ceiling for a given CPU count.
///
/// One CPU may run at 100% of its capacity before we worry; with two the
/// ceiling is 95% of the pair, with more it drops to 80% since a healthy
/// multi-core box should have headroom.
fn load_ceiling(cpu_count: usize) -> f64 {
    let count = cpu_count.max(1) as f64;
    if count <= 1.0 {
        count
    } else if count <= 2.0 {
        count * 0.95
    } else {
        count * 0.8
    }
}

fn clock_ticks() -> i64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::Document;
    use nw_config::ConfigProvider;

    #[test]
    fn test_load_ceiling() {
        assert_eq!(load_ceiling(1), 1.0);
        assert_eq!(load_ceiling(2), 1.9);
        assert_eq!(load_ceiling(4), 3.2);
        assert_eq!(load_ceiling(0), 1.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_on_tick_live() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigProvider::new();
        config.set("cache-path", dir.path().to_str().unwrap());
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        let mut host = HostServices::new(&mut doc, &config, &state);

        CpuProbe::new().on_tick(&mut host).unwrap();

        let e = NodePath::root().key("cpu");
        assert!(doc.get(&e.key("count")).is_some());
        assert!(doc.get(&e.key("avg1")).is_some());
        assert!(doc.get(&e.key("time_of_boot")).is_some());
    }
}
