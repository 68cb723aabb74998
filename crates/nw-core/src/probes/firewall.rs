//! Firewall probe: make sure the firewall daemon is running.
//!
//! There is no reliable local way to prove the rule set is effective, so
//! the check is limited to the daemon's presence; a port-scan audit
//! belongs in an external, much slower tool.

use crate::collect::ProcessList;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Result};

const DEFAULT_FIREWALL_PROCESS: &str = "fwwatch";

pub struct FirewallProbe;

impl FirewallProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FirewallProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for FirewallProbe {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("firewall");
        let process_name = host.get_config_or("firewall-process-name", DEFAULT_FIREWALL_PROCESS);

        let list = ProcessList::load();
        let info = list.find(&process_name);
        host.output_process("firewall", &e, info, &process_name, 95)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::{Document, Value};
    use nw_config::ConfigProvider;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_daemon_reported() {
        let config = ConfigProvider::new();
        config.set("firewall-process-name", "nw-test-no-such-daemon");
        config.set("cache-path", "");
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, &config, &state);
            FirewallProbe::new().on_tick(&mut host).unwrap();
        }

        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 95);
        let entry = doc
            .get(&NodePath::root().key("firewall").key("process").at(0))
            .unwrap();
        assert_eq!(
            entry.get_key("error").and_then(Value::as_str),
            Some("missing")
        );
    }
}
