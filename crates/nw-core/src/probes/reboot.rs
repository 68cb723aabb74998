//! Reboot probe: watch the `/run/reboot-required` flag.
//!
//! The kernel package (and a few others) raise the flag after an
//! upgrade. The probe memoizes when it first saw the flag so the error
//! priority can grow the longer the reboot is postponed; the memo file
//! is removed once the host rebooted.

use crate::epoch_now;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Priority, Result};
use std::path::Path;
use tracing::error;

const DEFAULT_FLAG_FILE: &str = "/run/reboot-required";
const CACHE_FILE: &str = "reboot.txt";

pub struct RebootProbe;

impl RebootProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RebootProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for RebootProbe {
    fn name(&self) -> &'static str {
        "reboot"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("reboot");
        let flag_file = host.get_config_or("reboot-required-file", DEFAULT_FLAG_FILE);

        let required = Path::new(&flag_file).exists();
        host.doc()
            .set(&e.key("required"), if required { "true" } else { "false" });

        let cache = host.cache_path(CACHE_FILE);
        if !required {
            // rebooted (or never required): drop the memo
            if let Some(path) = cache {
                let _ = std::fs::remove_file(path);
            }
            return Ok(());
        }

        let now = epoch_now();
        let mut first_seen = now;
        if let Some(path) = &cache {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    if let Ok(date) = contents.trim().parse::<i64>() {
                        first_seen = date;
                    }
                }
                Err(_) => {
                    if let Err(e) = std::fs::write(path, first_seen.to_string()) {
                        error!(path = %path.display(),
                            "could not save the reboot first-seen date: {e}");
                    }
                }
            }
        }

        let days_pending = now / 86_400 - first_seen / 86_400;
        host.append_error(&e, "reboot", "Reboot is required.", age_priority(days_pending))?;

        Ok(())
    }
}

/// The longer a required reboot is postponed, the louder it gets.
fn age_priority(days: i64) -> Priority {
    if days < 4 {
        45
    } else if days < 10 {
        70
    } else if days < 30 {
        90
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::{Document, Value};
    use nw_config::ConfigProvider;

    fn run_probe(flag: &Path, cache_dir: &Path) -> Document {
        let config = ConfigProvider::new();
        config.set("reboot-required-file", flag.to_str().unwrap());
        config.set("cache-path", cache_dir.to_str().unwrap());
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, &config, &state);
            RebootProbe::new().on_tick(&mut host).unwrap();
        }
        doc
    }

    #[test]
    fn test_age_priority_ladder() {
        assert_eq!(age_priority(0), 45);
        assert_eq!(age_priority(3), 45);
        assert_eq!(age_priority(4), 70);
        assert_eq!(age_priority(9), 70);
        assert_eq!(age_priority(10), 90);
        assert_eq!(age_priority(29), 90);
        assert_eq!(age_priority(30), 100);
    }

    #[test]
    fn test_not_required_clears_memo() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join(CACHE_FILE), "123").unwrap();

        let doc = run_probe(&dir.path().join("reboot-required"), cache.path());
        assert_eq!(doc.error_count(), 0);
        assert_eq!(
            doc.get(&NodePath::root().key("reboot").key("required"))
                .and_then(Value::as_str),
            Some("false")
        );
        assert!(!cache.path().join(CACHE_FILE).exists());
    }

    #[test]
    fn test_fresh_flag_low_priority() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let flag = dir.path().join("reboot-required");
        std::fs::write(&flag, "").unwrap();

        let doc = run_probe(&flag, cache.path());
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 45);
        // the first-seen memo was recorded
        assert!(cache.path().join(CACHE_FILE).exists());
    }

    #[test]
    fn test_old_flag_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let flag = dir.path().join("reboot-required");
        std::fs::write(&flag, "").unwrap();
        // first seen six weeks ago
        let six_weeks = epoch_now() - 42 * 86_400;
        std::fs::write(cache.path().join(CACHE_FILE), six_weeks.to_string()).unwrap();

        let doc = run_probe(&flag, cache.path());
        assert_eq!(doc.max_error_priority(), 100);
    }
}
