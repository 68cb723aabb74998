//! Flags probe: report operational flags raised by other services.
//!
//! Services on the node raise a flag by dropping a small key=value file
//! in the flags directory and lower it by removing the file. The probe
//! relays every raised flag into the run document and rolls them up into
//! one error entry at the highest priority found.

use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::kvfile::KvFile;
use nw_common::{NodePath, Priority, Result};
use std::path::Path;
use tracing::warn;

const DEFAULT_FLAGS_PATH: &str = "/var/lib/nodewatch/flags";

/// Floor for the roll-up error priority; even informational flags should
/// show up in the persisted runs.
const MIN_PRIORITY: Priority = 5;

#[derive(Debug)]
struct Flag {
    unit: String,
    section: String,
    name: String,
    priority: Priority,
    manual_down: bool,
    date: i64,
    modified: i64,
    message: String,
    source_file: String,
    function: String,
    line: i64,
    tags: Vec<String>,
}

pub struct FlagsProbe;

impl FlagsProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FlagsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for FlagsProbe {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let flags_path = host.get_config_or("flags-path", DEFAULT_FLAGS_PATH);
        let flags = load_flags(Path::new(&flags_path));
        if flags.is_empty() {
            // nothing raised, nothing to say
            return Ok(());
        }

        let flg = NodePath::root().key("flags");
        let mut max_priority = MIN_PRIORITY;
        let mut names: Vec<&str> = Vec::with_capacity(flags.len());

        for flag in &flags {
            let entry = host.doc().push(&flg.key("flag"));
            host.doc().set(&entry.key("unit"), flag.unit.as_str());
            host.doc().set(&entry.key("section"), flag.section.as_str());
            host.doc().set(&entry.key("name"), flag.name.as_str());
            host.doc().set(&entry.key("priority"), flag.priority);
            host.doc().set(&entry.key("manual-down"), flag.manual_down);
            host.doc().set(&entry.key("date"), flag.date);
            host.doc().set(&entry.key("modified"), flag.modified);
            host.doc().set(&entry.key("message"), flag.message.as_str());
            host.doc().set(&entry.key("source-file"), flag.source_file.as_str());
            host.doc().set(&entry.key("function"), flag.function.as_str());
            host.doc().set(&entry.key("line"), flag.line);
            for tag in &flag.tags {
                let tags = entry.key("tags");
                let t = host.doc().push(&tags);
                host.doc().set(&t, tag.as_str());
            }

            names.push(&flag.name);
            max_priority = max_priority.max(flag.priority.clamp(0, 100));
        }

        let count = flags.len();
        host.append_error(
            &flg,
            "flags",
            &format!(
                "{count} flag{} {} raised -- {}",
                if count == 1 { "" } else { "s" },
                if count == 1 { "is" } else { "are" },
                names.join(", ")
            ),
            max_priority,
        )?;

        Ok(())
    }
}

fn load_flags(dir: &Path) -> Vec<Flag> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut flags = Vec::new();
    for path in paths {
        let file = match KvFile::load(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable flag file: {e}");
                continue;
            }
        };
        let Some(name) = file.get("name").filter(|n| !n.is_empty()) else {
            warn!(path = %path.display(), "flag file without a name");
            continue;
        };
        flags.push(Flag {
            unit: file.get("unit").unwrap_or("").to_string(),
            section: file.get("section").unwrap_or("").to_string(),
            name: name.to_string(),
            priority: file
                .get_i64("priority")
                .ok()
                .flatten()
                .map(|p| (p as Priority).clamp(0, 100))
                .unwrap_or(MIN_PRIORITY),
            manual_down: file.get_bool("manual-down"),
            date: file.get_i64("date").ok().flatten().unwrap_or(0),
            modified: file.get_i64("modified").ok().flatten().unwrap_or(0),
            message: file.get("message").unwrap_or("").to_string(),
            source_file: file.get("source-file").unwrap_or("").to_string(),
            function: file.get("function").unwrap_or("").to_string(),
            line: file.get_i64("line").ok().flatten().unwrap_or(0),
            tags: file
                .get("tags")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        });
    }
    flags
}
