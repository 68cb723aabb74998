//! The probe registry: discovery, ordering, and ownership of probes.
//!
//! Probes are compiled in: the registry owns a factory table keyed by
//! short name and instantiates the configured selection at worker
//! startup. Names may be given with or without the conventional `nw_`
//! prefix; `*` or an empty selection loads every builtin.
//!
//! Dependencies order initialization only. Probes must not rely on each
//! other's document writes: each one has to produce correct output with
//! no other probe having run first.

use crate::host::HostServices;
use crate::probes;
use nw_common::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// Conventional probe name prefix.
pub const PROBE_PREFIX: &str = "nw_";

/// One unit of health-checking logic, invoked once per tick.
pub trait Probe: Send {
    /// Short name; also the probe's key in the result document.
    fn name(&self) -> &'static str;

    /// Names of probes that must have loaded before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Run one check against the current run's document.
    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()>;
}

type ProbeFactory = fn() -> Box<dyn Probe>;

/// The builtin probe set, in discovery order.
fn builtin_factories() -> Vec<(&'static str, ProbeFactory)> {
    vec![
        ("apt", || Box::new(probes::apt::AptProbe::new())),
        ("certificate", || {
            Box::new(probes::certificate::CertificateProbe::new())
        }),
        ("cpu", || Box::new(probes::cpu::CpuProbe::new())),
        ("disk", || Box::new(probes::disk::DiskProbe::new())),
        ("firewall", || Box::new(probes::firewall::FirewallProbe::new())),
        ("flags", || Box::new(probes::flags::FlagsProbe::new())),
        ("log", || Box::new(probes::logs::LogProbe::new())),
        ("memory", || Box::new(probes::memory::MemoryProbe::new())),
        ("network", || Box::new(probes::network::NetworkProbe::new())),
        ("packages", || Box::new(probes::packages::PackagesProbe::new())),
        ("processes", || {
            Box::new(probes::processes::ProcessesProbe::new())
        }),
        ("reboot", || Box::new(probes::reboot::RebootProbe::new())),
        ("scripts", || Box::new(probes::scripts::ScriptsProbe::new())),
    ]
}

/// Owns the loaded probes in dependency-respecting order.
pub struct Registry {
    probes: Vec<Box<dyn Probe>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("probes", &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Load the configured selection.
    ///
    /// `selection` is a comma-separated list of probe names, each with or
    /// without the `nw_` prefix; `*` or empty loads all builtins. Unknown
    /// names fail with a configuration error, duplicates are rejected,
    /// and dependency cycles fail the load.
    pub fn load(selection: &str) -> Result<Self> {
        let factories = builtin_factories();
        let selection = selection.trim();

        let requested: Vec<String> = if selection.is_empty() || selection == "*" {
            factories.iter().map(|(name, _)| name.to_string()).collect()
        } else {
            selection
                .split(',')
                .map(|raw| normalize_name(raw.trim()))
                .filter(|name| !name.is_empty())
                .collect()
        };

        let mut probes: Vec<Box<dyn Probe>> = Vec::with_capacity(requested.len());
        let mut seen: HashMap<String, ()> = HashMap::new();
        for name in &requested {
            if seen.insert(name.clone(), ()).is_some() {
                return Err(Error::DuplicateProbe(name.clone()));
            }
            let factory = factories
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, f)| f)
                .ok_or_else(|| Error::UnknownProbe(format!("{PROBE_PREFIX}{name}")))?;
            probes.push(factory());
        }

        let probes = order_probes(probes)?;
        info!(count = probes.len(), "probe registry loaded");
        for probe in &probes {
            debug!(probe = probe.name(), "loaded probe");
        }
        Ok(Self { probes })
    }

    /// Probes in dependency-respecting order.
    pub fn ordered_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Probe>> {
        self.probes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Loaded probe names, in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    #[cfg(test)]
    pub(crate) fn from_probes(probes: Vec<Box<dyn Probe>>) -> Result<Self> {
        Ok(Self {
            probes: order_probes(probes)?,
        })
    }
}

/// Strip the conventional prefix so both `cpu` and `nw_cpu` address the
/// same registry entry.
fn normalize_name(name: &str) -> String {
    name.strip_prefix(PROBE_PREFIX).unwrap_or(name).to_string()
}

/// Stable topological sort.
///
/// Ties resolve in input order, so the execution order for a fixed
/// selection is reproducible. Dependencies naming probes outside the
/// selection impose nothing. A cycle fails the load.
fn order_probes(probes: Vec<Box<dyn Probe>>) -> Result<Vec<Box<dyn Probe>>> {
    let index: HashMap<&str, usize> = probes
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name(), i))
        .collect();

    let mut ordered: Vec<usize> = Vec::with_capacity(probes.len());
    // 0 = unvisited, 1 = on the current path, 2 = done
    let mut mark = vec![0u8; probes.len()];

    fn visit(
        i: usize,
        probes: &[Box<dyn Probe>],
        index: &HashMap<&str, usize>,
        mark: &mut [u8],
        ordered: &mut Vec<usize>,
    ) -> Result<()> {
        match mark[i] {
            2 => return Ok(()),
            1 => return Err(Error::Cycle(probes[i].name().to_string())),
            _ => {}
        }
        mark[i] = 1;
        for dep in probes[i].dependencies() {
            let dep = dep.strip_prefix(PROBE_PREFIX).unwrap_or(dep);
            if let Some(&j) = index.get(dep) {
                visit(j, probes, index, mark, ordered)?;
            }
        }
        mark[i] = 2;
        ordered.push(i);
        Ok(())
    }

    for i in 0..probes.len() {
        visit(i, &probes, &index, &mut mark, &mut ordered)?;
    }

    let mut slots: Vec<Option<Box<dyn Probe>>> = probes.into_iter().map(Some).collect();
    Ok(ordered
        .into_iter()
        .map(|i| slots[i].take().expect("each index appears once"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProbe {
        name: &'static str,
        deps: &'static [&'static str],
    }

    impl Probe for FakeProbe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }
        fn on_tick(&mut self, _host: &mut HostServices<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn fake(name: &'static str, deps: &'static [&'static str]) -> Box<dyn Probe> {
        Box::new(FakeProbe { name, deps })
    }

    #[test]
    fn test_load_all_builtins() {
        let registry = Registry::load("*").unwrap();
        assert_eq!(registry.len(), 13);
        let registry = Registry::load("").unwrap();
        assert_eq!(registry.len(), 13);
    }

    #[test]
    fn test_load_selection_with_prefix_normalization() {
        let registry = Registry::load("cpu,nw_memory, disk").unwrap();
        assert_eq!(registry.names(), vec!["cpu", "memory", "disk"]);
    }

    #[test]
    fn test_unknown_probe_rejected() {
        let err = Registry::load("cpu,bogus").unwrap_err();
        assert!(matches!(err, Error::UnknownProbe(name) if name == "nw_bogus"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = Registry::load("cpu,nw_cpu").unwrap_err();
        assert!(matches!(err, Error::DuplicateProbe(name) if name == "cpu"));
    }

    #[test]
    fn test_topological_order() {
        let registry = Registry::from_probes(vec![
            fake("c", &["b"]),
            fake("b", &["a"]),
            fake("a", &[]),
        ])
        .unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_stable_for_independent_probes() {
        let registry = Registry::from_probes(vec![
            fake("z", &[]),
            fake("m", &[]),
            fake("a", &[]),
        ])
        .unwrap();
        // no dependencies: input order is preserved
        assert_eq!(registry.names(), vec!["z", "m", "a"]);
    }

    #[test]
    fn test_dependency_outside_selection_ignored() {
        let registry =
            Registry::from_probes(vec![fake("a", &["not_loaded"]), fake("b", &[])]).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = Registry::from_probes(vec![fake("a", &["b"]), fake("b", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn test_self_cycle_detected() {
        let err = Registry::from_probes(vec![fake("a", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }
}
