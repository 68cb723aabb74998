//! The NodeWatch configuration provider.
//!
//! Settings come from three layers, later layers winning: built-in
//! defaults, a `key=value` configuration file, and explicit overrides
//! (CLI flags or dynamic updates pushed over the bus). Typed getters
//! validate and clamp on read and cache the result; a configuration-change
//! notification invalidates the cached value for that key, including
//! transitive dependents (`statistics-ttl` is recomputed when
//! `statistics-period` changes).
//!
//! The provider is shared between the worker thread (reader) and the main
//! thread (invalidator); a single mutex serializes access so a reader
//! always sees a consistent snapshot for one read.

pub mod tiers;

pub use tiers::{ReportTiers, Tier};

use nw_common::kvfile::KvFile;
use nw_common::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Well-known setting names.
pub mod keys {
    pub const ADMINISTRATOR_EMAIL: &str = "administrator-email";
    pub const CACHE_PATH: &str = "cache-path";
    pub const DATA_PATH: &str = "data-path";
    pub const DISK_IGNORE: &str = "disk-ignore";
    pub const ERROR_REPORT_CRITICAL: &str = "error-report-critical-priority";
    pub const ERROR_REPORT_LOW: &str = "error-report-low-priority";
    pub const ERROR_REPORT_MEDIUM: &str = "error-report-medium-priority";
    pub const ERROR_REPORT_SETTLE_TIME: &str = "error-report-settle-time";
    pub const FROM_EMAIL: &str = "from-email";
    pub const PLUGINS: &str = "plugins";
    pub const STATISTICS_FREQUENCY: &str = "statistics-frequency";
    pub const STATISTICS_PERIOD: &str = "statistics-period";
    pub const STATISTICS_TTL: &str = "statistics-ttl";
}

/// Built-in defaults for settings that have one.
const DEFAULTS: &[(&str, &str)] = &[
    (keys::CACHE_PATH, "/var/cache/nodewatch"),
    (keys::DATA_PATH, "/var/lib/nodewatch"),
    (keys::ERROR_REPORT_CRITICAL, "90,86400"),
    (keys::ERROR_REPORT_LOW, "10,604800"),
    (keys::ERROR_REPORT_MEDIUM, "50,259200"),
    (keys::ERROR_REPORT_SETTLE_TIME, "300"),
    (
        keys::PLUGINS,
        "apt,cpu,disk,flags,log,memory,network,packages,processes,scripts",
    ),
    (keys::STATISTICS_FREQUENCY, "60"),
    (keys::STATISTICS_PERIOD, "604800"),
    (keys::STATISTICS_TTL, "off"),
    ("script-starter", "/bin/sh"),
];

/// Typed values cached after validation.
#[derive(Debug, Default)]
struct Cache {
    statistics_frequency: Option<u64>,
    statistics_period: Option<u64>,
    statistics_ttl: Option<u64>,
    settle_time: Option<u64>,
    tiers: Option<ReportTiers>,
}

#[derive(Debug, Default)]
struct Inner {
    raw: HashMap<String, String>,
    cache: Cache,
}

/// Thread-safe settings store with typed, clamped, cached getters.
#[derive(Debug, Default)]
pub struct ConfigProvider {
    inner: Mutex<Inner>,
}

impl ConfigProvider {
    /// Provider with built-in defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider loaded from a `key=value` configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = KvFile::load(path)?;
        let provider = Self::new();
        {
            // every key passes through; the typed getters validate the
            // ones they own and probes read theirs untyped
            let mut inner = provider.inner.lock().expect("config lock poisoned");
            for (key, value) in file.entries() {
                inner.raw.insert(key.to_string(), value.to_string());
            }
        }
        Ok(provider)
    }

    /// Set or override a single setting and drop its cached value.
    ///
    /// Used for CLI overrides at startup and for dynamic updates arriving
    /// over the bus while running.
    pub fn set(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        inner.raw.insert(key.to_string(), value.to_string());
        invalidate_key(&mut inner.cache, key);
    }

    /// Drop the cached value for `key` and its dependents.
    ///
    /// Called when a configuration-change notification names a setting;
    /// the next read recomputes from the raw layers.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        invalidate_key(&mut inner.cache, key);
    }

    /// Raw value of a setting, after layer resolution. Empty strings are
    /// returned as configured (a probe may treat empty as "disabled").
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("config lock poisoned");
        raw_get(&inner.raw, key)
    }

    /// Raw value with a caller-supplied fallback.
    pub fn get_or(&self, key: &str, fallback: &str) -> String {
        self.get(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// How often probes run, in seconds. Minimum one minute.
    pub fn statistics_frequency(&self) -> u64 {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        if let Some(v) = inner.cache.statistics_frequency {
            return v;
        }
        let v = clamped_seconds(&inner.raw, keys::STATISTICS_FREQUENCY, 60, 60);
        inner.cache.statistics_frequency = Some(v);
        v
    }

    /// Retention window for on-disk snapshots, in seconds. Minimum one
    /// hour, rounded up to a whole hour.
    pub fn statistics_period(&self) -> u64 {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        statistics_period_locked(&mut inner)
    }

    /// TTL attached to persisted statistics: 0 when off, the retention
    /// period for `use-period`, otherwise a duration of at least one hour.
    pub fn statistics_ttl(&self) -> u64 {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        if let Some(v) = inner.cache.statistics_ttl {
            return v;
        }
        let raw = raw_get(&inner.raw, keys::STATISTICS_TTL).unwrap_or_default();
        let v = match raw.trim() {
            "" | "off" => 0,
            "use-period" => statistics_period_locked(&mut inner),
            text => match text.parse::<u64>() {
                Ok(0) => 0,
                Ok(n) if n < 3_600 => {
                    warn!(value = n, "statistics-ttl below one hour, clamping");
                    3_600
                }
                Ok(n) => n,
                Err(_) => {
                    warn!(value = text, "statistics-ttl is not a duration, turning off");
                    0
                }
            },
        };
        inner.cache.statistics_ttl = Some(v);
        v
    }

    /// Startup grace period before any report may fire, in seconds.
    /// Minimum one minute.
    pub fn error_report_settle_time(&self) -> u64 {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        if let Some(v) = inner.cache.settle_time {
            return v;
        }
        let v = clamped_seconds(&inner.raw, keys::ERROR_REPORT_SETTLE_TIME, 300, 60);
        inner.cache.settle_time = Some(v);
        v
    }

    /// The three report tiers, individually clamped and cross-ordered.
    pub fn report_tiers(&self) -> ReportTiers {
        let mut inner = self.inner.lock().expect("config lock poisoned");
        if let Some(t) = inner.cache.tiers {
            return t;
        }
        let low = inner.raw.get(keys::ERROR_REPORT_LOW).cloned();
        let medium = inner.raw.get(keys::ERROR_REPORT_MEDIUM).cloned();
        let critical = inner.raw.get(keys::ERROR_REPORT_CRITICAL).cloned();
        let t = tiers::resolve_tiers(low.as_deref(), medium.as_deref(), critical.as_deref());
        inner.cache.tiers = Some(t);
        t
    }

    /// The configured probe list, comma separated; `*` or empty means all.
    pub fn plugins(&self) -> String {
        self.get(keys::PLUGINS).unwrap_or_default()
    }
}

fn raw_get(raw: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(v) = raw.get(key) {
        return Some(v.clone());
    }
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

fn statistics_period_locked(inner: &mut Inner) -> u64 {
    if let Some(v) = inner.cache.statistics_period {
        return v;
    }
    let v = clamped_seconds(&inner.raw, keys::STATISTICS_PERIOD, 604_800, 3_600);
    // round up to the hour, kept in seconds
    let v = v.div_ceil(3_600) * 3_600;
    inner.cache.statistics_period = Some(v);
    v
}

fn clamped_seconds(raw: &HashMap<String, String>, key: &str, default: u64, min: u64) -> u64 {
    let text = raw_get(raw, key).unwrap_or_default();
    match text.trim().parse::<u64>() {
        Ok(v) if v < min => {
            warn!(setting = key, value = v, min, "duration too short, clamping");
            min
        }
        Ok(v) => v,
        Err(_) => {
            warn!(setting = key, value = %text, "duration is not a number, using default");
            default.max(min)
        }
    }
}

fn invalidate_key(cache: &mut Cache, key: &str) {
    match key {
        keys::STATISTICS_FREQUENCY => cache.statistics_frequency = None,
        keys::STATISTICS_PERIOD => {
            cache.statistics_period = None;
            // the TTL may be derived from the period
            cache.statistics_ttl = None;
        }
        keys::STATISTICS_TTL => cache.statistics_ttl = None,
        keys::ERROR_REPORT_SETTLE_TIME => cache.settle_time = None,
        keys::ERROR_REPORT_LOW | keys::ERROR_REPORT_MEDIUM | keys::ERROR_REPORT_CRITICAL => {
            cache.tiers = None;
        }
        // untyped settings are read from the raw layer every time
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigProvider::new();
        assert_eq!(config.statistics_frequency(), 60);
        assert_eq!(config.statistics_period(), 604_800);
        assert_eq!(config.statistics_ttl(), 0);
        assert_eq!(config.error_report_settle_time(), 300);
        assert_eq!(config.report_tiers(), ReportTiers::default());
        assert_eq!(config.get(keys::CACHE_PATH).as_deref(), Some("/var/cache/nodewatch"));
        assert_eq!(config.get(keys::FROM_EMAIL), None);
    }

    #[test]
    fn test_frequency_clamped_to_minute() {
        let config = ConfigProvider::new();
        config.set(keys::STATISTICS_FREQUENCY, "10");
        assert_eq!(config.statistics_frequency(), 60);
        config.set(keys::STATISTICS_FREQUENCY, "300");
        assert_eq!(config.statistics_frequency(), 300);
    }

    #[test]
    fn test_period_rounded_up_to_hour() {
        let config = ConfigProvider::new();
        config.set(keys::STATISTICS_PERIOD, "4000");
        assert_eq!(config.statistics_period(), 7_200);
        config.set(keys::STATISTICS_PERIOD, "100");
        assert_eq!(config.statistics_period(), 3_600);
    }

    #[test]
    fn test_ttl_modes() {
        let config = ConfigProvider::new();
        assert_eq!(config.statistics_ttl(), 0);

        config.set(keys::STATISTICS_TTL, "use-period");
        config.set(keys::STATISTICS_PERIOD, "7200");
        assert_eq!(config.statistics_ttl(), 7_200);

        config.set(keys::STATISTICS_TTL, "1800");
        assert_eq!(config.statistics_ttl(), 3_600);

        config.set(keys::STATISTICS_TTL, "off");
        assert_eq!(config.statistics_ttl(), 0);
    }

    #[test]
    fn test_transitive_invalidation() {
        let config = ConfigProvider::new();
        config.set(keys::STATISTICS_TTL, "use-period");
        config.set(keys::STATISTICS_PERIOD, "7200");
        assert_eq!(config.statistics_period(), 7_200);
        assert_eq!(config.statistics_ttl(), 7_200);

        // a change notification for the period must also refresh the TTL
        config.set(keys::STATISTICS_PERIOD, "14400");
        config.invalidate(keys::STATISTICS_PERIOD);
        assert_eq!(config.statistics_period(), 14_400);
        assert_eq!(config.statistics_ttl(), 14_400);
    }

    #[test]
    fn test_settle_time_minimum() {
        let config = ConfigProvider::new();
        config.set(keys::ERROR_REPORT_SETTLE_TIME, "5");
        assert_eq!(config.error_report_settle_time(), 60);
    }

    #[test]
    fn test_tier_invalidation() {
        let config = ConfigProvider::new();
        assert_eq!(config.report_tiers().medium.priority, 50);
        config.set(keys::ERROR_REPORT_MEDIUM, "60,259200");
        assert_eq!(config.report_tiers().medium.priority, 60);
    }

    #[test]
    fn test_from_file() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodewatch.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# nodewatch settings").unwrap();
        writeln!(f, "statistics-frequency=120").unwrap();
        writeln!(f, "administrator-email=admin@example.com").unwrap();
        writeln!(f, "plugins=cpu,memory").unwrap();
        drop(f);

        let config = ConfigProvider::from_file(&path).unwrap();
        assert_eq!(config.statistics_frequency(), 120);
        assert_eq!(
            config.get(keys::ADMINISTRATOR_EMAIL).as_deref(),
            Some("admin@example.com")
        );
        assert_eq!(config.plugins(), "cpu,memory");
    }

    #[test]
    fn test_get_or_fallback() {
        let config = ConfigProvider::new();
        assert_eq!(config.get_or("scripts-path", "/usr/share/nodewatch/scripts"),
                   "/usr/share/nodewatch/scripts");
        config.set("scripts-path", "/opt/scripts");
        assert_eq!(config.get_or("scripts-path", "/usr/share/nodewatch/scripts"), "/opt/scripts");
    }
}
