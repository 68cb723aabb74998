//! Running-process records from /proc/<pid>/.
//!
//! One [`ProcessList::load`] walks the numeric entries of /proc once and
//! keeps everything the probes ask about: the command line for matching,
//! memory sizes, the controlling tty, and the four CPU-time counters.
//! Processes that disappear mid-scan are skipped silently; a scan never
//! fails because of pid churn.

use std::path::Path;

/// One running process.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    /// Short name: basename of argv[0], or the kernel comm for threads
    /// without a command line.
    pub name: String,
    /// Full command line, arguments joined with single spaces.
    pub cmdline: String,
    /// CPU time counters in clock ticks (user, system, children user,
    /// children system).
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    /// Controlling terminal, decoded from the stat tty_nr field.
    pub tty_major: i32,
    pub tty_minor: i32,
    /// Virtual size in KiB.
    pub total_size_kib: u64,
    /// Resident set size in KiB.
    pub resident_kib: u64,
    /// CPU usage since the process started, percent.
    pub cpu_percent: f64,
}

/// Snapshot of all running processes.
#[derive(Debug, Default)]
pub struct ProcessList {
    procs: Vec<ProcessInfo>,
}

impl ProcessList {
    /// Scan /proc.
    pub fn load() -> Self {
        Self::load_from(Path::new("/proc"))
    }

    /// Scan an alternate proc root (fixtures in tests).
    pub fn load_from(root: &Path) -> Self {
        let uptime = read_uptime(root);
        let hertz = clock_ticks_per_second();
        let page_kib = page_size_kib();

        let mut procs = Vec::new();
        let Ok(entries) = std::fs::read_dir(root) else {
            return Self { procs };
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(pid) = file_name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if let Some(info) = read_process(&entry.path(), pid, uptime, hertz, page_kib) {
                procs.push(info);
            }
        }
        procs.sort_by_key(|p| p.pid);
        Self { procs }
    }

    /// First process whose short name equals `name`.
    pub fn find(&self, name: &str) -> Option<&ProcessInfo> {
        self.procs.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.procs.iter()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

fn read_process(
    dir: &Path,
    pid: i32,
    uptime: f64,
    hertz: f64,
    page_kib: u64,
) -> Option<ProcessInfo> {
    let stat_text = std::fs::read_to_string(dir.join("stat")).ok()?;
    let stat = parse_stat(&stat_text)?;

    let cmdline_raw = std::fs::read(dir.join("cmdline")).unwrap_or_default();
    let args: Vec<String> = cmdline_raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();

    let (name, cmdline) = if args.is_empty() {
        // kernel thread or zombie: fall back to the comm field
        (stat.comm.clone(), stat.comm.clone())
    } else {
        let name = Path::new(&args[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| args[0].clone());
        (name, args.join(" "))
    };

    // CPU% since the process started
    let cpu_seconds = (stat.utime + stat.stime) as f64 / hertz;
    let elapsed = uptime - stat.starttime as f64 / hertz;
    let cpu_percent = if elapsed > 0.0 {
        (cpu_seconds / elapsed * 100.0).min(100.0 * num_cpus() as f64)
    } else {
        0.0
    };

    Some(ProcessInfo {
        pid,
        name,
        cmdline,
        utime: stat.utime,
        stime: stat.stime,
        cutime: stat.cutime,
        cstime: stat.cstime,
        tty_major: ((stat.tty_nr >> 8) & 0xfff) as i32,
        tty_minor: ((stat.tty_nr & 0xff) | ((stat.tty_nr >> 12) & 0xfff00)) as i32,
        total_size_kib: stat.vsize / 1024,
        resident_kib: stat.rss_pages * page_kib,
        cpu_percent,
    })
}

#[derive(Debug, Default, PartialEq)]
struct StatFields {
    comm: String,
    tty_nr: u64,
    utime: u64,
    stime: u64,
    cutime: u64,
    cstime: u64,
    starttime: u64,
    vsize: u64,
    rss_pages: u64,
}

/// Parse one /proc/<pid>/stat line.
///
/// The comm field is parenthesized and may itself contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(text: &str) -> Option<StatFields> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let comm = text.get(open + 1..close)?.to_string();
    let rest = text.get(close + 1..)?.trim_start();

    // rest starts at field 3 (state); stat fields are 1-based
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let get = |one_based: usize| -> u64 {
        fields
            .get(one_based - 3)
            .and_then(|f| f.parse().ok())
            .unwrap_or(0)
    };

    Some(StatFields {
        comm,
        tty_nr: get(7),
        utime: get(14),
        stime: get(15),
        cutime: get(16),
        cstime: get(17),
        starttime: get(22),
        vsize: get(23),
        rss_pages: get(24),
    })
}

fn read_uptime(root: &Path) -> f64 {
    std::fs::read_to_string(root.join("uptime"))
        .ok()
        .and_then(|text| {
            text.split_whitespace()
                .next()
                .and_then(|f| f.parse().ok())
        })
        .unwrap_or(0.0)
}

fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as f64
    } else {
        100.0
    }
}

fn page_size_kib() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as u64 / 1024
    } else {
        4
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
