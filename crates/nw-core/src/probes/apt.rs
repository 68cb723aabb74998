//! APT probe: pending package updates as reported by the update checker.
//!
//! The cluster manager runs `apt-check` periodically and drops its
//! output into `apt-check.output` under its cache directory. The file
//! holds `<epoch>;<total>;<security>`, or `-1` when apt-check itself is
//! unavailable. The probe only reads that file; a missing or stale file
//! is itself a finding since it means the manager stopped updating it.

use crate::epoch_now;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::kvfile::KvFile;
use nw_common::{NodePath, Result};
use std::path::Path;

const DEFAULT_MANAGER_CONFIG: &str = "/etc/nodewatch/manager.conf";
const DEFAULT_MANAGER_CACHE: &str = "/var/cache/nodewatch-manager";

/// The cache is refreshed daily; one extra hour covers a slow check.
const FRESH_WINDOW: i64 = 86_400 + 3_600;

/// What the apt-check output file told us.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AptStatus {
    /// apt-check is not available on this system.
    CheckUnavailable,
    /// Recent data: pending update counters.
    Fresh {
        cached_on: i64,
        total: i64,
        security: i64,
    },
    /// The file has not been refreshed for more than a day.
    Stale { cached_on: i64 },
    /// The file content did not parse.
    Unparsable,
}

fn evaluate(contents: &str, now: i64) -> AptStatus {
    let contents = contents.trim();
    if contents == "-1" {
        return AptStatus::CheckUnavailable;
    }

    let fields: Vec<&str> = contents.split(';').collect();
    if fields.len() != 3 {
        return AptStatus::Unparsable;
    }
    let Ok(cached_on) = fields[0].trim().parse::<i64>() else {
        return AptStatus::Unparsable;
    };
    let Ok(total) = fields[1].trim().parse::<i64>() else {
        return AptStatus::Unparsable;
    };
    let Ok(security) = fields[2].trim().parse::<i64>() else {
        return AptStatus::Unparsable;
    };

    if cached_on + FRESH_WINDOW >= now {
        AptStatus::Fresh {
            cached_on,
            total,
            security,
        }
    } else {
        AptStatus::Stale { cached_on }
    }
}

pub struct AptProbe;

impl AptProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AptProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for AptProbe {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let apt = NodePath::root().key("apt");

        // the manager may relocate its cache in its own configuration
        let manager_config = host.get_config_or("manager-config", DEFAULT_MANAGER_CONFIG);
        let cache_path = KvFile::load(Path::new(&manager_config))
            .ok()
            .and_then(|file| file.get("cache_path").map(str::to_string))
            .unwrap_or_else(|| DEFAULT_MANAGER_CACHE.to_string());
        let output_file = format!("{cache_path}/apt-check.output");

        let contents = match std::fs::read_to_string(&output_file) {
            Ok(contents) => contents,
            Err(_) => {
                let message = format!(
                    "\"{output_file}\" file is missing, nodewatch is not \
                     getting APT status updates from the cluster manager"
                );
                host.doc().set(&apt.key("error"), message.as_str());
                host.append_error(&apt, "apt", &message, 20)?;
                return Ok(());
            }
        };

        match evaluate(&contents, epoch_now()) {
            AptStatus::CheckUnavailable => {
                let message = "we are unable to check whether some updates are available \
                     (the `apt-check` command was not found)";
                host.doc().set(&apt.key("error"), message);
                host.append_error(&apt, "apt", message, 98)?;
            }
            AptStatus::Fresh {
                cached_on,
                total,
                security,
            } => {
                host.doc().set(&apt.key("last-updated"), cached_on);
                if total == 0 {
                    // nothing pending
                    return Ok(());
                }
                host.doc().set(&apt.key("total-updates"), total);
                host.doc().set(&apt.key("security-updates"), security);

                let (message, priority) = if security != 0 {
                    (
                        "there are packages including security updates that need \
                         to be upgraded on this system.",
                        52,
                    )
                } else {
                    (
                        "there are standard packages that can be upgraded now on \
                         this system.",
                        45,
                    )
                };
                host.doc().set(&apt.key("error"), message);
                host.append_error(&apt, "apt", message, priority)?;
            }
            AptStatus::Stale { cached_on } => {
                host.doc().set(&apt.key("last-updated"), cached_on);
                let message = format!(
                    "\"{output_file}\" file is out of date, the cluster manager \
                     did not update it for more than a day"
                );
                host.doc().set(&apt.key("error"), message.as_str());
                host.append_error(&apt, "apt", &message, 50)?;
            }
            AptStatus::Unparsable => {
                let message = format!(
                    "could not figure out the contents of \"{output_file}\", \
                     the cluster manager may have changed the format"
                );
                host.doc().set(&apt.key("error"), message.as_str());
                host.append_error(&apt, "apt", &message, 15)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::Document;
    use nw_config::ConfigProvider;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_evaluate_unavailable() {
        assert_eq!(evaluate("-1", NOW), AptStatus::CheckUnavailable);
        assert_eq!(evaluate(" -1\n", NOW), AptStatus::CheckUnavailable);
    }

    #[test]
    fn test_evaluate_fresh() {
        let text = format!("{};4;2", NOW - 600);
        assert_eq!(
            evaluate(&text, NOW),
            AptStatus::Fresh {
                cached_on: NOW - 600,
                total: 4,
                security: 2
            }
        );
    }

    #[test]
    fn test_evaluate_stale() {
        let old = NOW - FRESH_WINDOW - 1;
        let text = format!("{old};4;2");
        assert_eq!(evaluate(&text, NOW), AptStatus::Stale { cached_on: old });
    }

    #[test]
    fn test_evaluate_unparsable() {
        assert_eq!(evaluate("", NOW), AptStatus::Unparsable);
        assert_eq!(evaluate("1;2", NOW), AptStatus::Unparsable);
        assert_eq!(evaluate("a;b;c", NOW), AptStatus::Unparsable);
        assert_eq!(evaluate("1;2;3;4", NOW), AptStatus::Unparsable);
    }

    fn run_probe(manager_cache: &Path) -> Document {
        let manager_conf = manager_cache.join("manager.conf");
        std::fs::write(
            &manager_conf,
            format!("cache_path={}\n", manager_cache.display()),
        )
        .unwrap();

        let config = ConfigProvider::new();
        config.set("manager-config", manager_conf.to_str().unwrap());
        config.set("cache-path", "");
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, &config, &state);
            AptProbe::new().on_tick(&mut host).unwrap();
        }
        doc
    }

    #[test]
    fn test_missing_file_low_priority_error() {
        let dir = tempfile::tempdir().unwrap();
        let doc = run_probe(dir.path());
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 20);
    }

    #[test]
    fn test_security_updates_pending() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("apt-check.output"),
            format!("{};7;3", epoch_now() - 60),
        )
        .unwrap();

        let doc = run_probe(dir.path());
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 52);

        let apt = NodePath::root().key("apt");
        assert_eq!(
            doc.get(&apt.key("total-updates"))
                .and_then(nw_common::Value::as_i64),
            Some(7)
        );
        assert_eq!(
            doc.get(&apt.key("security-updates"))
                .and_then(nw_common::Value::as_i64),
            Some(3)
        );
    }

    #[test]
    fn test_no_updates_quiet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("apt-check.output"),
            format!("{};0;0", epoch_now() - 60),
        )
        .unwrap();

        let doc = run_probe(dir.path());
        assert_eq!(doc.error_count(), 0);
    }
}
