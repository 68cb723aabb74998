//! Memory probe: /proc/meminfo figures plus high-memory and high-swap
//! detection.

use crate::collect::{read_meminfo, MemInfo};
use crate::host::HostServices;
use crate::registry::Probe;
use nw_common::{NodePath, Result};

pub struct MemoryProbe;

impl MemoryProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for MemoryProbe {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("memory");
        let info = read_meminfo();

        host.doc().set(&e.key("mem_total"), info.mem_total);
        host.doc().set(&e.key("mem_free"), info.mem_free);
        host.doc().set(&e.key("mem_available"), info.mem_available);
        host.doc().set(&e.key("mem_buffers"), info.buffers);
        host.doc().set(&e.key("mem_cached"), info.cached);
        host.doc().set(&e.key("swap_cached"), info.swap_cached);
        host.doc().set(&e.key("swap_total"), info.swap_total);
        host.doc().set(&e.key("swap_free"), info.swap_free);

        if high_memory_usage(&info) {
            host.append_error(&e, "memory", "High memory usage", 75)?;
        }

        if high_swap_usage(&info) {
            host.append_error(&e, "memory", "High swap usage", 65)?;
        }

        Ok(())
    }
}

/// True when available memory is both under 512 MiB and under 20% of the
/// total. Boxes with plenty of absolute headroom never alert, however
/// large their caches look.
fn high_memory_usage(info: &MemInfo) -> bool {
    if info.mem_total == 0 {
        return false;
    }
    if info.mem_available > 512 * 1024 * 1024 {
        return false;
    }
    (info.mem_available as f64) / (info.mem_total as f64) < 0.2
}

/// True when more than half the swap is in use. A healthy system should
/// sit well under 10%.
fn high_swap_usage(info: &MemInfo) -> bool {
    if info.swap_total == 0 {
        return false;
    }
    (info.swap_free as f64) / (info.swap_total as f64) < 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn info(total: u64, available: u64, swap_total: u64, swap_free: u64) -> MemInfo {
        MemInfo {
            mem_total: total,
            mem_available: available,
            swap_total,
            swap_free,
            ..MemInfo::default()
        }
    }

    #[test]
    fn test_high_memory_needs_both_conditions() {
        // plenty of absolute headroom: fine even at a low ratio
        assert!(!high_memory_usage(&info(64 * GIB, GIB, 0, 0)));
        // little absolute memory but a good ratio: fine
        assert!(!high_memory_usage(&info(GIB, 400 * 1024 * 1024, 0, 0)));
        // under 512MiB and under 20%: high
        assert!(high_memory_usage(&info(4 * GIB, 256 * 1024 * 1024, 0, 0)));
    }

    #[test]
    fn test_high_memory_zero_total() {
        assert!(!high_memory_usage(&info(0, 0, 0, 0)));
    }

    #[test]
    fn test_high_swap() {
        assert!(!high_swap_usage(&info(GIB, GIB, 2 * GIB, 2 * GIB)));
        assert!(!high_swap_usage(&info(GIB, GIB, 2 * GIB, GIB + GIB / 2)));
        assert!(high_swap_usage(&info(GIB, GIB, 2 * GIB, GIB / 2)));
        // no swap configured: never high
        assert!(!high_swap_usage(&info(GIB, GIB, 0, 0)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_on_tick_live() {
        use crate::host::DaemonState;
        use nw_common::{Document, Value};
        use nw_config::ConfigProvider;

        let config = ConfigProvider::new();
        config.set("cache-path", "");
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        let mut host = HostServices::new(&mut doc, &config, &state);

        MemoryProbe::new().on_tick(&mut host).unwrap();

        let total = doc
            .get(&NodePath::root().key("memory").key("mem_total"))
            .and_then(Value::as_i64)
            .unwrap();
        assert!(total > 0);
    }
}
