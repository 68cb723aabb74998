//! Processes probe: verify that a configured set of processes is
//! running.
//!
//! Expected processes are declared one per file under the processes
//! definition directory:
//!
//! ```text
//! name=clusterd
//! mandatory=true
//! command=clusterd
//! service=clusterd
//! backend=false
//! match=clusterd .*--listen
//! ```
//!
//! A definition tied to a systemd service is only expected to run while
//! the service is enabled or active; backend services additionally honor
//! the cluster manager's global backend switch and roster. A process
//! missing while the host is in maintenance mode is reported at a token
//! priority so a planned outage does not page anyone.

use crate::collect::ProcessList;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::kvfile::KvFile;
use nw_common::{Error, NodePath, Result};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

const DEFAULT_DEFINITIONS_PATH: &str = "/usr/share/nodewatch/processes";
const DEFAULT_MANAGER_CONFIG: &str = "/etc/nodewatch/manager.conf";
const DEFAULT_MAINTENANCE_CONFIG: &str = "/etc/apache2/nodewatch-conf/maintenance.conf";

/// Enabled/active answers for a systemd unit.
pub(crate) type ServiceQuery<'a> = &'a dyn Fn(&str) -> (bool, bool);

/// One expected-process declaration.
#[derive(Debug)]
struct ProcessDefinition {
    name: String,
    command: Option<String>,
    match_re: Option<Regex>,
    mandatory: bool,
    allow_duplicates: bool,
    service: Option<String>,
    service_enabled: bool,
    service_active: bool,
    backend: bool,
}

impl ProcessDefinition {
    /// Match a running process's short name and command line against
    /// this definition.
    fn matches(&self, command: &str, cmdline: &str) -> bool {
        if let Some(expected) = &self.command {
            if expected != command {
                return false;
            }
        }
        if let Some(re) = &self.match_re {
            if !re.is_match(cmdline) {
                return false;
            }
        }
        if self.command.is_none() && self.match_re.is_none() {
            // with no command and no regex the definition name is the
            // process name
            if self.name != command {
                return false;
            }
        }
        true
    }

    /// Whether this process should currently be running.
    fn expected_to_run(&self, manager: &ManagerState) -> bool {
        if self.service.is_none() {
            return true;
        }
        if self.backend {
            if manager.backend_status_disabled {
                return false;
            }
            let service = self.service.as_deref().unwrap_or_default();
            return manager.backends.iter().any(|b| b == service);
        }
        self.service_enabled || self.service_active
    }
}

/// The cluster manager's global backend switches.
#[derive(Debug, Default)]
struct ManagerState {
    backend_status_disabled: bool,
    backends: Vec<String>,
}

impl ManagerState {
    fn load(path: &Path) -> Self {
        let Ok(file) = KvFile::load(path) else {
            return Self::default();
        };
        Self {
            backend_status_disabled: file.get("backend-status") == Some("disabled"),
            backends: file
                .get("backends")
                .map(|list| {
                    list.split(',')
                        .map(|b| b.trim().to_string())
                        .filter(|b| !b.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

pub struct ProcessesProbe;

impl ProcessesProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessesProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for ProcessesProbe {
    fn name(&self) -> &'static str {
        "processes"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let definitions_path =
            host.get_config_or("processes-path", DEFAULT_DEFINITIONS_PATH);
        let manager_path = host.get_config_or("manager-config", DEFAULT_MANAGER_CONFIG);
        let maintenance_path =
            host.get_config_or("maintenance-config", DEFAULT_MAINTENANCE_CONFIG);

        let mut definitions =
            load_definitions(Path::new(&definitions_path), &systemd_service_state)?;
        let manager = ManagerState::load(Path::new(&manager_path));

        let e = NodePath::root().key("processes");
        let list = ProcessList::load();

        for info in list.iter() {
            if definitions.is_empty() {
                break;
            }
            if let Some(idx) = definitions
                .iter()
                .position(|def| def.matches(&info.name, &info.cmdline))
            {
                let def = definitions.remove(idx);
                host.output_process("processes", &e, Some(info), &def.name, 35)?;

                // a backend running while turned off is wrong too
                if def.backend && !def.expected_to_run(&manager) {
                    host.append_error(
                        &e,
                        "processes",
                        &format!("found process \"{}\" running when disabled.", def.name),
                        35,
                    )?;
                }
            }
        }

        // whatever is left was not found on the system
        for def in &definitions {
            let proc_entry = host.doc().push(&e.key("process"));
            host.doc().set(&proc_entry.key("name"), def.name.as_str());

            if !def.expected_to_run(&manager) {
                host.doc().set(&proc_entry.key("resident"), "no");
                continue;
            }

            host.doc().set(&proc_entry.key("error"), "missing");

            let (message, mut priority) = if def.mandatory {
                (
                    format!(
                        "can't find mandatory process \"{}\" in the list of processes.",
                        def.name
                    ),
                    95,
                )
            } else {
                (
                    format!(
                        "can't find expected process \"{}\" in the list of processes.",
                        def.name
                    ),
                    60,
                )
            };

            if def.backend && in_maintenance(Path::new(&maintenance_path)) {
                // a backend missing during planned maintenance is noise
                priority = 5;
            }

            host.append_error(&proc_entry, "processes", &message, priority)?;
        }

        Ok(())
    }
}

/// Load every `*.conf` definition under `dir`.
///
/// Duplicate names are allowed only when every duplicate says so; the
/// surviving definition is mandatory if any duplicate was.
fn load_definitions(dir: &Path, query: ServiceQuery<'_>) -> Result<Vec<ProcessDefinition>> {
    let mut definitions: Vec<ProcessDefinition> = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "no process definitions directory");
        return Ok(definitions);
    };

    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "conf").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        let file = match KvFile::load(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable process definition: {e}");
                continue;
            }
        };
        let Some(name) = file.get("name").map(str::to_string) else {
            continue;
        };

        let mandatory = file.get_bool("mandatory");
        let allow_duplicates = file.get_bool("allow_duplicates");

        if let Some(existing) = definitions.iter_mut().find(|def| def.name == name) {
            if !allow_duplicates || !existing.allow_duplicates {
                return Err(Error::Config(format!(
                    "found process \"{name}\" twice and duplicates are not allowed."
                )));
            }
            // duplicates merge to the strictest requirement
            existing.mandatory |= mandatory;
            continue;
        }

        let match_re = match file.get("match") {
            None => None,
            Some(raw) => match Regex::new(raw) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(path = %path.display(), pattern = raw,
                        "invalid match pattern in process definition: {e}");
                    None
                }
            },
        };

        let service = file.get("service").map(str::to_string);
        let (service_enabled, service_active) = match &service {
            Some(service) => query(service),
            None => (true, true),
        };

        definitions.push(ProcessDefinition {
            name,
            command: file.get("command").map(str::to_string),
            match_re,
            mandatory,
            allow_duplicates,
            service,
            service_enabled,
            service_active,
            backend: file.get_bool("backend"),
        });
    }

    Ok(definitions)
}

/// Query systemd for a unit's enabled and active state.
///
/// `show -p UnitFileState` is used instead of `is-enabled` so units that
/// are not even installed answer with an empty value instead of an
/// error.
fn systemd_service_state(service: &str) -> (bool, bool) {
    let enabled = Command::new("systemctl")
        .args(["show", "-p", "UnitFileState", "--value", service])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "enabled")
        .unwrap_or(false);

    let active = enabled
        && Command::new("systemctl")
            .args(["is-active", "--quiet", service])
            .status()
            .map(|status| status.success())
            .unwrap_or(false);

    (enabled, active)
}

/// Detect maintenance mode from the web server maintenance config.
///
/// Maintenance is on when the `##MAINTENANCE-START##` marker is followed
/// (after whitespace) by an uncommented line, and a `Retry-After` header
/// is present.
fn in_maintenance(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_maintenance(&contents),
        Err(_) => false,
    }
}

fn parse_maintenance(contents: &str) -> bool {
    let Some(pos) = contents.find("##MAINTENANCE-START##") else {
        return false;
    };
    let after = &contents[pos + "##MAINTENANCE-START##".len()..];
    let Some(first) = after.trim_start().chars().next() else {
        return false;
    };
    if first == '#' {
        // the maintenance block is commented out
        return false;
    }
    contents.contains("Retry-After")
}
