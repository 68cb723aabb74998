//! Network probe: is the cluster bus daemon running, and are we actually
//! connected to it?
//!
//! The process check and the connection check are distinct findings: the
//! daemon can be up while our endpoint lost its session. The connection
//! outage escalates with its duration, measured from the last known-good
//! connection.

use crate::collect::ProcessList;
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Priority, Result};

const DEFAULT_BUS_PROCESS: &str = "clusterd";

/// Grace period after startup before a never-connected endpoint is an
/// error; the bus daemon may still be starting alongside us.
const STARTUP_GRACE: i64 = 5 * 60;

pub struct NetworkProbe;

impl NetworkProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for NetworkProbe {
    fn name(&self) -> &'static str {
        "network"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("network");
        let bus_name = host.get_config_or("bus-process-name", DEFAULT_BUS_PROCESS);

        let list = ProcessList::load();
        let info = list.find(&bus_name);
        if !host.output_process("network", &e, info, &bus_name, 99)? {
            // the daemon is not even running; the missing-process error
            // already covers it
            return Ok(());
        }

        verify_connection(host, &e, &bus_name, crate::epoch_now())?;
        Ok(())
    }
}

/// Check the endpoint's own connection to the bus daemon.
fn verify_connection(
    host: &mut HostServices<'_>,
    e: &NodePath,
    bus_name: &str,
    now: i64,
) -> Result<()> {
    if host.state().bus_is_connected() {
        return Ok(());
    }

    let connected_at = host.state().bus_connected_at();
    let disconnected_at = host.state().bus_disconnected_at();

    let duration = if connected_at == 0 {
        // never connected since startup
        let since_start = now - disconnected_at;
        if since_start < STARTUP_GRACE {
            return Ok(());
        }
        since_start - STARTUP_GRACE
    } else {
        now - connected_at
    };

    let service = e.key("service");
    host.doc().set(&service.key("name"), bus_name);
    host.doc().set(&service.key("error"), "not connected");

    host.append_error(
        e,
        "network",
        &format!(
            "found the \"{bus_name}\" process but the endpoint is not \
             connected, and has not been for {duration} seconds."
        ),
        outage_priority(duration),
    )?;
    Ok(())
}

/// Outage severity grows with its length.
fn outage_priority(duration: i64) -> Priority {
    if duration > 15 * 60 {
        100
    } else if duration > 5 * 60 {
        65
    } else if duration > 60 {
        30
    } else {
        15
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::{Document, Value};
    use nw_config::ConfigProvider;

    #[test]
    fn test_outage_priority_ladder() {
        assert_eq!(outage_priority(0), 15);
        assert_eq!(outage_priority(60), 15);
        assert_eq!(outage_priority(61), 30);
        assert_eq!(outage_priority(5 * 60), 30);
        assert_eq!(outage_priority(5 * 60 + 1), 65);
        assert_eq!(outage_priority(15 * 60), 65);
        assert_eq!(outage_priority(15 * 60 + 1), 100);
    }

    fn run_verify(state: &DaemonState, now: i64) -> Document {
        let config = ConfigProvider::new();
        config.set("cache-path", "");
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, &config, state);
            let e = NodePath::root().key("network");
            verify_connection(&mut host, &e, "clusterd", now).unwrap();
        }
        doc
    }

    #[test]
    fn test_connected_is_quiet() {
        let state = DaemonState::new(1000);
        state.set_bus_connected(true, 1010);
        let doc = run_verify(&state, 2000);
        assert_eq!(doc.error_count(), 0);
    }

    #[test]
    fn test_startup_grace() {
        // never connected, 2 minutes after start: still within grace
        let state = DaemonState::new(1000);
        let doc = run_verify(&state, 1000 + 120);
        assert_eq!(doc.error_count(), 0);
    }

    #[test]
    fn test_never_connected_after_grace() {
        let state = DaemonState::new(1000);
        // 7 minutes after start: 2 minutes past grace
        let doc = run_verify(&state, 1000 + 7 * 60);
        assert_eq!(doc.error_count(), 1);
        // effective outage is 2 minutes -> priority 30
        assert_eq!(doc.max_error_priority(), 30);

        let service = NodePath::root().key("network").key("service");
        let doc_service = doc.get(&service).unwrap();
        assert_eq!(
            doc_service.get_key("error").and_then(Value::as_str),
            Some("not connected")
        );
    }

    #[test]
    fn test_long_outage_is_critical() {
        let state = DaemonState::new(1000);
        state.set_bus_connected(true, 2000);
        state.set_bus_connected(false, 2100);
        // 20 minutes since the last good connection
        let doc = run_verify(&state, 2000 + 20 * 60);
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 100);
    }
}
