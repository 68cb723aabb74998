//! System-wide counters from /proc.
//!
//! [`SysStats`] loads each source file lazily and at most once per
//! instance, so a probe asking for five load-average-derived figures
//! reads `/proc/loadavg` a single time. One instance is meant to live for
//! one probe tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// CPU time columns of the `cpu` line in /proc/stat, in jiffies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTimes {
    pub user: i64,
    pub nice: i64,
    pub system: i64,
    pub idle: i64,
    pub iowait: i64,
    pub irq: i64,
    pub softirq: i64,
}

/// Lazily-loaded snapshot of the system-wide /proc counters.
#[derive(Debug, Default)]
pub struct SysStats {
    root: PathBuf,

    uptime: Option<(f64, f64)>,
    loadavg: Option<LoadAvg>,
    stat: Option<Stat>,
    vmstat: Option<HashMap<String, i64>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct LoadAvg {
    avg1: f64,
    avg5: f64,
    avg15: f64,
    running_threads: i64,
    total_threads: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stat {
    cpu: CpuTimes,
    boot_time: i64,
    context_switches: i64,
    interrupts: i64,
    processes: i64,
    procs_running: i64,
    procs_blocked: i64,
}

impl SysStats {
    /// Snapshot reading from `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Snapshot reading from an alternate root (tests point this at a
    /// fixture directory).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Seconds since boot.
    pub fn uptime(&mut self) -> f64 {
        self.load_uptime().0
    }

    /// Cumulative idle seconds across all CPUs since boot.
    pub fn idle(&mut self) -> f64 {
        self.load_uptime().1
    }

    pub fn load_avg1(&mut self) -> f64 {
        self.load_loadavg().avg1
    }

    pub fn load_avg5(&mut self) -> f64 {
        self.load_loadavg().avg5
    }

    pub fn load_avg15(&mut self) -> f64 {
        self.load_loadavg().avg15
    }

    pub fn running_threads(&mut self) -> i64 {
        self.load_loadavg().running_threads
    }

    pub fn total_threads(&mut self) -> i64 {
        self.load_loadavg().total_threads
    }

    pub fn cpu_times(&mut self) -> CpuTimes {
        self.load_stat().cpu
    }

    /// Boot time as epoch seconds (the `btime` line).
    pub fn boot_time(&mut self) -> i64 {
        self.load_stat().boot_time
    }

    pub fn context_switches(&mut self) -> i64 {
        self.load_stat().context_switches
    }

    pub fn interrupts(&mut self) -> i64 {
        self.load_stat().interrupts
    }

    /// Total forks since boot (the `processes` line).
    pub fn processes(&mut self) -> i64 {
        self.load_stat().processes
    }

    pub fn procs_running(&mut self) -> i64 {
        self.load_stat().procs_running
    }

    pub fn procs_blocked(&mut self) -> i64 {
        self.load_stat().procs_blocked
    }

    pub fn page_in(&mut self) -> i64 {
        self.vmstat_value("pgpgin")
    }

    pub fn page_out(&mut self) -> i64 {
        self.vmstat_value("pgpgout")
    }

    pub fn swap_in(&mut self) -> i64 {
        self.vmstat_value("pswpin")
    }

    pub fn swap_out(&mut self) -> i64 {
        self.vmstat_value("pswpout")
    }

    fn load_uptime(&mut self) -> (f64, f64) {
        if let Some(v) = self.uptime {
            return v;
        }
        let text = read_or_empty(&self.root.join("uptime"));
        let mut fields = text.split_whitespace();
        let up = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        let idle = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        self.uptime = Some((up, idle));
        (up, idle)
    }

    fn load_loadavg(&mut self) -> LoadAvg {
        if let Some(v) = self.loadavg {
            return v;
        }
        let text = read_or_empty(&self.root.join("loadavg"));
        let mut fields = text.split_whitespace();
        let mut avg = LoadAvg::default();
        avg.avg1 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        avg.avg5 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        avg.avg15 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        if let Some(threads) = fields.next() {
            let mut parts = threads.splitn(2, '/');
            avg.running_threads = parts.next().and_then(|f| f.parse().ok()).unwrap_or(0);
            avg.total_threads = parts.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        }
        self.loadavg = Some(avg);
        avg
    }

    fn load_stat(&mut self) -> Stat {
        if let Some(v) = self.stat {
            return v;
        }
        let text = read_or_empty(&self.root.join("stat"));
        let mut stat = Stat::default();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let Some(tag) = fields.next() else { continue };
            match tag {
                "cpu" => {
                    let mut next = || fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
                    stat.cpu = CpuTimes {
                        user: next(),
                        nice: next(),
                        system: next(),
                        idle: next(),
                        iowait: next(),
                        irq: next(),
                        softirq: next(),
                    };
                }
                "btime" => stat.boot_time = first_i64(fields.next()),
                "ctxt" => stat.context_switches = first_i64(fields.next()),
                "intr" => stat.interrupts = first_i64(fields.next()),
                "processes" => stat.processes = first_i64(fields.next()),
                "procs_running" => stat.procs_running = first_i64(fields.next()),
                "procs_blocked" => stat.procs_blocked = first_i64(fields.next()),
                _ => {}
            }
        }
        self.stat = Some(stat);
        stat
    }

    fn vmstat_value(&mut self, key: &str) -> i64 {
        if self.vmstat.is_none() {
            let text = read_or_empty(&self.root.join("vmstat"));
            let mut map = HashMap::new();
            for line in text.lines() {
                let mut fields = line.split_whitespace();
                if let (Some(k), Some(v)) = (fields.next(), fields.next()) {
                    if let Ok(n) = v.parse() {
                        map.insert(k.to_string(), n);
                    }
                }
            }
            self.vmstat = Some(map);
        }
        self.vmstat
            .as_ref()
            .and_then(|m| m.get(key).copied())
            .unwrap_or(0)
    }
}

fn first_i64(field: Option<&str>) -> i64 {
    field.and_then(|f| f.parse().ok()).unwrap_or(0)
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// /proc/meminfo
// ---------------------------------------------------------------------------

/// Memory figures from /proc/meminfo, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Read and parse /proc/meminfo.
pub fn read_meminfo() -> MemInfo {
    parse_meminfo(&read_or_empty(Path::new("/proc/meminfo")))
}

/// Parse meminfo text. Values are reported by the kernel in kB and
/// converted to bytes.
pub fn parse_meminfo(text: &str) -> MemInfo {
    let mut info = MemInfo::default();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest
            .trim()
            .trim_end_matches(" kB")
            .trim()
            .parse::<u64>()
            .unwrap_or(0)
            * 1024;
        match key {
            "MemTotal" => info.mem_total = value,
            "MemFree" => info.mem_free = value,
            "MemAvailable" => info.mem_available = value,
            "Buffers" => info.buffers = value,
            "Cached" => info.cached = value,
            "SwapCached" => info.swap_cached = value,
            "SwapTotal" => info.swap_total = value,
            "SwapFree" => info.swap_free = value,
            _ => {}
        }
    }
    info
}
