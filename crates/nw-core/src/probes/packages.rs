//! Packages probe: required, unwanted, and conflicting packages.
//!
//! Package expectations are declared one per file:
//!
//! ```text
//! name=ntp
//! installation=required
//! priority=60
//! description="clock drift ruins cluster consensus"
//! conflicts=ntpdate
//! ```
//!
//! `dpkg-query` answers are memoized in a small cache file so a tick
//! does not fork once per package; the cache is only extended, and a
//! package upgrade or removal shows up after the cache file is removed
//! (the manager does that whenever it installs anything).

use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::kvfile::KvFile;
use nw_common::{NodePath, Priority, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

const DEFAULT_DEFINITIONS_PATH: &str = "/usr/share/nodewatch/packages";
const CACHE_FILE: &str = "packages-cache.txt";
const DEFAULT_PRIORITY: Priority = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Installation {
    Optional,
    Required,
    Unwanted,
}

impl Installation {
    fn parse(raw: &str) -> Self {
        match raw {
            "required" => Installation::Required,
            "unwanted" => Installation::Unwanted,
            _ => Installation::Optional,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Installation::Optional => "optional",
            Installation::Required => "required",
            Installation::Unwanted => "unwanted",
        }
    }
}

#[derive(Debug)]
struct PackageDefinition {
    name: String,
    installation: Installation,
    priority: Priority,
    description: String,
    conflicts: Vec<String>,
}

/// Installed-state lookup with the on-disk memo in front of dpkg-query.
struct InstalledCache<'a> {
    states: HashMap<String, bool>,
    modified: bool,
    query: &'a dyn Fn(&str) -> bool,
}

impl<'a> InstalledCache<'a> {
    fn load(path: Option<&Path>, query: &'a dyn Fn(&str) -> bool) -> Self {
        let mut states = HashMap::new();
        if let Some(path) = path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                for line in contents.lines() {
                    if let Some((name, value)) = line.split_once('=') {
                        if !name.is_empty() {
                            states.insert(name.to_string(), value == "t");
                        }
                    }
                }
            }
        }
        Self {
            states,
            modified: false,
            query,
        }
    }

    fn is_installed(&mut self, package: &str) -> bool {
        if let Some(&installed) = self.states.get(package) {
            return installed;
        }
        let installed = (self.query)(package);
        debug!(package, installed, "package state from dpkg-query");
        self.states.insert(package.to_string(), installed);
        self.modified = true;
        installed
    }

    fn save(&self, path: &Path) {
        let mut entries: Vec<_> = self.states.iter().collect();
        entries.sort();
        let contents: String = entries
            .iter()
            .map(|(name, installed)| {
                format!("{name}={}\n", if **installed { 't' } else { 'f' })
            })
            .collect();
        if let Err(e) = std::fs::write(path, contents) {
            warn!(path = %path.display(), "could not save the package cache: {e}");
        }
    }
}

pub struct PackagesProbe {
    query: Box<dyn Fn(&str) -> bool + Send>,
}

impl PackagesProbe {
    pub fn new() -> Self {
        Self {
            query: Box::new(dpkg_query_installed),
        }
    }

    #[cfg(test)]
    fn with_query(query: impl Fn(&str) -> bool + Send + 'static) -> Self {
        Self {
            query: Box::new(query),
        }
    }
}

impl Default for PackagesProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for PackagesProbe {
    fn name(&self) -> &'static str {
        "packages"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let definitions_path = host.get_config_or("packages-path", DEFAULT_DEFINITIONS_PATH);
        let definitions = load_definitions(Path::new(&definitions_path));
        if definitions.is_empty() {
            return Ok(());
        }

        let cache_path = host.cache_path(CACHE_FILE);
        let mut cache = InstalledCache::load(cache_path.as_deref(), &self.query);

        let e = NodePath::root().key("packages");

        for def in &definitions {
            let installed = cache.is_installed(&def.name);

            let entry = host.doc().push(&e.key("package"));
            host.doc().set(&entry.key("name"), def.name.as_str());
            host.doc()
                .set(&entry.key("installation"), def.installation.as_str());
            host.doc().set(&entry.key("installed"), installed);

            match def.installation {
                Installation::Required if !installed => {
                    host.append_error(
                        &entry,
                        "packages",
                        &with_description(
                            format!("required package \"{}\" is not installed", def.name),
                            &def.description,
                        ),
                        def.priority,
                    )?;
                }
                Installation::Unwanted if installed => {
                    host.append_error(
                        &entry,
                        "packages",
                        &with_description(
                            format!("unwanted package \"{}\" is installed", def.name),
                            &def.description,
                        ),
                        def.priority,
                    )?;
                }
                _ => {}
            }

            if installed {
                let in_conflict: Vec<&str> = def
                    .conflicts
                    .iter()
                    .filter(|conflict| cache.is_installed(conflict))
                    .map(String::as_str)
                    .collect();
                if !in_conflict.is_empty() {
                    host.append_error(
                        &entry,
                        "packages",
                        &with_description(
                            format!(
                                "package \"{}\" is in conflict with installed package{} {}",
                                def.name,
                                if in_conflict.len() == 1 { "" } else { "s" },
                                in_conflict.join(", ")
                            ),
                            &def.description,
                        ),
                        def.priority,
                    )?;
                }
            }
        }

        if cache.modified {
            if let Some(path) = &cache_path {
                cache.save(path);
            }
        }

        Ok(())
    }
}

fn with_description(message: String, description: &str) -> String {
    if description.is_empty() {
        message
    } else {
        format!("{message} ({description})")
    }
}

fn load_definitions(dir: &Path) -> Vec<PackageDefinition> {
    let mut definitions: Vec<PackageDefinition> = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "no package definitions directory");
        return definitions;
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
                warn!(path = %path.display(), "skipping package definition: {e}");
                continue;
            }
        };
        let Some(name) = file.get("name").filter(|n| valid_package_name(n)) else {
            warn!(path = %path.display(), "package definition without a valid name");
            continue;
        };
        let name = name.to_string();
        if definitions.iter().any(|def| def.name == name) {
            warn!(package = %name, "duplicate package definition skipped");
            continue;
        }

        let priority = match file.get_i64("priority") {
            Ok(Some(p)) => (p as Priority).clamp(0, 100),
            Ok(None) => DEFAULT_PRIORITY,
            Err(e) => {
                warn!(path = %path.display(), "bad priority in package definition: {e}");
                DEFAULT_PRIORITY
            }
        };

        let conflicts: Vec<String> = file
            .get("conflicts")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty() && *c != name)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        definitions.push(PackageDefinition {
            name,
            installation: Installation::parse(file.get("installation").unwrap_or("optional")),
            priority,
            description: file.get("description").unwrap_or("").to_string(),
            conflicts,
        });
    }

    definitions
}

/// Debian package names: lowercase alphanumerics plus `-+.`, starting
/// with an alphanumeric character.
fn valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | ':'))
}

/// Ask dpkg whether a package is in the `install ok installed` state.
fn dpkg_query_installed(package: &str) -> bool {
    Command::new("dpkg-query")
        .args(["--showformat=${Status}", "--show", package])
        .output()
        .map(|out| {
            out.status.success()
                && String::from_utf8_lossy(&out.stdout).trim() == "install ok installed"
        })
        .unwrap_or(false)
}
