//! Log probe: existence, size, ownership, and permissions of log files,
//! plus optional content searches.
//!
//! Log definitions live one per file under the log-definitions
//! directory:
//!
//! ```text
//! name=clusterd
//! mandatory=true
//! path=/var/log/clusterd
//! patterns=clusterd.log:clusterd-*.log
//! user_name=clusterd
//! group_name=adm
//! max_size=10M
//! mode=640/777
//!
//! [search]
//! pattern=segmentation fault
//! ```
//!
//! `mode` accepts an octal value with an optional `/mask`, or a symbolic
//! spec (`ug+rw`). Each `[search]` section adds a regex counted against
//! every matched log file.

use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::kvfile::KvFile;
use nw_common::{Error, NodePath, Result};
use regex::Regex;
use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};

const DEFAULT_DEFINITIONS_PATH: &str = "/usr/share/nodewatch/log-definitions";

/// Default size ceiling when a definition does not name one: 10 MiB.
const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug)]
struct LogDefinition {
    name: String,
    mandatory: bool,
    path: String,
    patterns: Vec<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    max_size: u64,
    mode: u32,
    mode_mask: u32,
    searches: Vec<Regex>,
}

pub struct LogProbe;

impl LogProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for LogProbe {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let definitions_path =
            host.get_config_or("log-definitions-path", DEFAULT_DEFINITIONS_PATH);
        let definitions = load_definitions(Path::new(&definitions_path));

        let e = NodePath::root().key("logs");

        for def in &definitions {
            let mut found = false;
            for pattern in &def.patterns {
                for filename in glob_dir(Path::new(&def.path), pattern) {
                    found = true;
                    check_log(host, &e, def, &filename)?;
                }
            }
            if !found && def.mandatory {
                host.append_error(
                    &e,
                    "log",
                    &format!(
                        "no logs found for {} which says it is mandatory to have at least one log file",
                        def.name
                    ),
                    85,
                )?;
            }
        }

        Ok(())
    }
}

fn check_log(
    host: &mut HostServices<'_>,
    e: &NodePath,
    def: &LogDefinition,
    filename: &Path,
) -> Result<()> {
    let Ok(meta) = std::fs::metadata(filename) else {
        // rotated away between the directory listing and the stat
        return Ok(());
    };

    let l = host.doc().push(&e.key("log"));
    host.doc().set(&l.key("name"), def.name.as_str());
    host.doc()
        .set(&l.key("filename"), filename.to_string_lossy().as_ref());
    host.doc().set(&l.key("size"), meta.size());
    host.doc().set(&l.key("mode"), meta.mode() as i64);
    host.doc().set(&l.key("uid"), meta.uid());
    host.doc().set(&l.key("gid"), meta.gid());
    host.doc().set(&l.key("mtime"), meta.mtime());

    if meta.size() > def.max_size {
        host.append_error(
            &l,
            "log",
            &format!(
                "size of log file {} ({}) is {}, which is more than the maximum size of {}",
                def.name,
                filename.display(),
                meta.size(),
                def.max_size
            ),
            if meta.size() > def.max_size * 2 { 73 } else { 58 },
        )?;
    }

    if let Some(uid) = def.uid {
        if uid != meta.uid() {
            host.append_error(
                &l,
                "log",
                &format!(
                    "log file owner mismatched for {} ({}), found {} expected {uid}",
                    def.name,
                    filename.display(),
                    meta.uid()
                ),
                63,
            )?;
        }
    }

    if let Some(gid) = def.gid {
        if gid != meta.gid() {
            host.append_error(
                &l,
                "log",
                &format!(
                    "log file group mismatched for {} ({}), found {} expected {gid}",
                    def.name,
                    filename.display(),
                    meta.gid()
                ),
                59,
            )?;
        }
    }

    if def.mode != 0 && (meta.mode() & def.mode_mask) != def.mode {
        host.append_error(
            &l,
            "log",
            &format!(
                "log file mode mismatched for {} ({}), found {:o} expected {:o}",
                def.name,
                filename.display(),
                meta.mode() & 0o7777,
                def.mode
            ),
            64,
        )?;
    }

    if !def.searches.is_empty() {
        if let Ok(contents) = std::fs::read_to_string(filename) {
            for re in &def.searches {
                let matches = contents.lines().filter(|line| re.is_match(line)).count();
                let s = host.doc().push(&l.key("search"));
                host.doc().set(&s.key("pattern"), re.as_str());
                host.doc().set(&s.key("matches"), matches as i64);
            }
        }
    }

    Ok(())
}

fn load_definitions(dir: &Path) -> Vec<LogDefinition> {
    let mut definitions: Vec<LogDefinition> = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "no log definitions directory");
        return definitions;
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "conf").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        match load_definition(&path) {
            Ok(def) => {
                if definitions.iter().any(|d| d.name == def.name) {
                    warn!(name = %def.name, "duplicate log definition skipped");
                    continue;
                }
                definitions.push(def);
            }
            Err(e) => warn!(path = %path.display(), "skipping log definition: {e}"),
        }
    }

    definitions
}

fn load_definition(path: &Path) -> Result<LogDefinition> {
    let file = KvFile::load(path)?;

    let name = file
        .get("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::MissingField("name".into()))?
        .to_string();

    let log_path = file.get("path").unwrap_or("/var/log").to_string();

    let patterns: Vec<String> = file
        .get("patterns")
        .map(|raw| {
            raw.split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| vec![format!("{name}*.log")]);

    let uid = match file.get("user_name") {
        Some(user) => Some(resolve_user(user).ok_or_else(|| Error::InvalidValue {
            field: "user_name".into(),
            message: format!("unknown user {user:?}"),
        })?),
        None => None,
    };
    let gid = match file.get("group_name") {
        Some(group) => Some(resolve_group(group).ok_or_else(|| Error::InvalidValue {
            field: "group_name".into(),
            message: format!("unknown group {group:?}"),
        })?),
        None => None,
    };

    let max_size = match file.get("max_size") {
        Some(raw) => parse_size(raw).ok_or_else(|| Error::InvalidValue {
            field: "max_size".into(),
            message: format!("{raw:?} is not a valid size"),
        })?,
        None => DEFAULT_MAX_SIZE,
    };

    let (mode, mode_mask) = match file.get("mode") {
        Some(raw) => parse_mode(raw).ok_or_else(|| Error::InvalidValue {
            field: "mode".into(),
            message: format!("{raw:?} is not a valid mode"),
        })?,
        None => (0, 0),
    };

    let mut searches = Vec::new();
    for section in file.sections("search") {
        if let Some(pattern) = section.get("pattern") {
            match Regex::new(pattern) {
                Ok(re) => searches.push(re),
                Err(e) => warn!(pattern, "invalid search pattern skipped: {e}"),
            }
        }
    }

    Ok(LogDefinition {
        name,
        mandatory: file.get_bool("mandatory"),
        path: log_path,
        patterns,
        uid,
        gid,
        max_size,
        mode,
        mode_mask,
        searches,
    })
}

/// List files in `dir` whose name matches a `*`/`?` glob pattern.
fn glob_dir(dir: &Path, pattern: &str) -> Vec<std::path::PathBuf> {
    let Some(re) = glob_to_regex(pattern) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut matches: Vec<_> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| re.is_match(name))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    matches
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`).
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 1024),
        'm' | 'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' | 'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Parse a mode spec: octal with optional `/mask`, or symbolic.
///
/// Returns `(mode, mask)`. A bare octal value compares all permission
/// bits; a symbolic spec masks only the classes it names.
fn parse_mode(raw: &str) -> Option<(u32, u32)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.chars().next()?.is_ascii_digit() {
        let (mode_str, mask_str) = match raw.split_once('/') {
            Some((m, k)) => (m, Some(k)),
            None => (raw, None),
        };
        let mode = u32::from_str_radix(mode_str, 8).ok()?;
        let mask = match mask_str {
            Some(k) => u32::from_str_radix(k, 8).ok()?,
            None => 0o7777,
        };
        return Some((mode, mask));
    }

    // symbolic: classes, then an operator, then permissions
    let mut classes = 0u32;
    let mut chars = raw.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            'u' => classes |= 0o700,
            'g' => classes |= 0o070,
            'o' => classes |= 0o007,
            'a' => classes |= 0o777,
            _ => break,
        }
        chars.next();
    }
    if classes == 0 {
        classes = 0o777;
    }

    match chars.next() {
        Some('+') | Some('=') => {}
        _ => return None,
    }

    let mut perms = 0u32;
    let mut special = 0u32;
    for c in chars {
        match c {
            'r' => perms |= 0o444,
            'w' => perms |= 0o222,
            'x' => perms |= 0o111,
            's' => special |= 0o6000,
            't' => special |= 0o1000,
            _ => return None,
        }
    }

    let mut mode = perms & classes;
    if special & 0o1000 != 0 {
        mode |= 0o1000;
    }
    if special & 0o6000 != 0 {
        if classes & 0o700 != 0 {
            mode |= 0o4000;
        }
        if classes & 0o070 != 0 {
            mode |= 0o2000;
        }
    }

    let mut mask = classes;
    if special != 0 {
        mask |= 0o7000;
    }
    Some((mode, mask))
}

fn resolve_user(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: getpwnam returns a pointer into static storage or null;
    // only the uid is read before any other call.
    unsafe {
        let pw = libc::getpwnam(c_name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_uid)
        }
    }
}

fn resolve_group(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: same contract as getpwnam.
    unsafe {
        let gr = libc::getgrnam(c_name.as_ptr());
        if gr.is_null() {
            None
        } else {
            Some((*gr).gr_gid)
        }
    }
}
