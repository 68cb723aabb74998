//! The services the core offers to every probe.
//!
//! Probes never see the server: they receive a [`HostServices`] handle
//! scoped to the current run. It carries the result document, the
//! configuration provider, and a few daemon facts (process start time,
//! bus connection state, hostname) that some probes report on.

use crate::collect::ProcessInfo;
use nw_common::{Document, NodePath, Priority, Result};
use nw_config::ConfigProvider;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::warn;

/// Daemon facts shared between the main thread and the worker.
///
/// The bus connection epochs are written by the main thread when the
/// endpoint connects or drops and read by the worker during a run, so
/// they are atomics rather than mutex-guarded state.
#[derive(Debug)]
pub struct DaemonState {
    /// Process start, epoch seconds. Drives the report settle time.
    pub started_at: i64,
    /// Host name reported in emails and disk errors.
    pub hostname: String,
    bus_connected: AtomicI64,
    bus_disconnected: AtomicI64,
}

impl DaemonState {
    pub fn new(started_at: i64) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            started_at,
            hostname,
            bus_connected: AtomicI64::new(0),
            // never connected yet counts as disconnected since startup
            bus_disconnected: AtomicI64::new(started_at),
        }
    }

    /// Record a bus connection state change.
    pub fn set_bus_connected(&self, connected: bool, now: i64) {
        if connected {
            self.bus_connected.store(now, Ordering::Relaxed);
        } else {
            self.bus_disconnected.store(now, Ordering::Relaxed);
        }
    }

    /// True while the endpoint holds a bus connection.
    pub fn bus_is_connected(&self) -> bool {
        self.bus_disconnected.load(Ordering::Relaxed) < self.bus_connected.load(Ordering::Relaxed)
    }

    /// Epoch of the last successful connection, 0 if never connected.
    pub fn bus_connected_at(&self) -> i64 {
        self.bus_connected.load(Ordering::Relaxed)
    }

    /// Epoch of the last disconnect.
    pub fn bus_disconnected_at(&self) -> i64 {
        self.bus_disconnected.load(Ordering::Relaxed)
    }
}

/// Per-run handle probes use to talk to the core.
pub struct HostServices<'a> {
    doc: &'a mut Document,
    config: &'a ConfigProvider,
    state: &'a DaemonState,
}

impl<'a> HostServices<'a> {
    pub fn new(doc: &'a mut Document, config: &'a ConfigProvider, state: &'a DaemonState) -> Self {
        Self { doc, config, state }
    }

    /// The result document for this run.
    pub fn doc(&mut self) -> &mut Document {
        self.doc
    }

    /// Daemon facts (start time, bus state, hostname).
    pub fn state(&self) -> &DaemonState {
        self.state
    }

    /// Record a structured error under `at` and bump the run counters.
    pub fn append_error(
        &mut self,
        at: &NodePath,
        producer: &str,
        message: &str,
        priority: Priority,
    ) -> Result<()> {
        self.doc.append_error(at, producer, message, priority)
    }

    /// Record an observed process under `at["process"]`.
    ///
    /// With `info` absent the named process was not found: a `missing`
    /// marker is written, an error is appended at the given priority, and
    /// `false` comes back so the probe can stop there.
    pub fn output_process(
        &mut self,
        producer: &str,
        at: &NodePath,
        info: Option<&ProcessInfo>,
        expected_name: &str,
        priority: Priority,
    ) -> Result<bool> {
        let entry = self.doc.push(&at.key("process"));
        self.doc.set(&entry.key("name"), expected_name);

        let Some(info) = info else {
            self.doc.set(&entry.key("error"), "missing");
            self.doc.append_error(
                at,
                producer,
                &format!(
                    "can't find mandatory process \"{expected_name}\" in the list of processes."
                ),
                priority,
            )?;
            return Ok(false);
        };

        self.doc.set(&entry.key("cmdline"), info.cmdline.as_str());
        self.doc.set(&entry.key("pcpu"), info.cpu_percent);
        self.doc.set(&entry.key("total_size"), info.total_size_kib);
        self.doc.set(&entry.key("resident"), info.resident_kib);
        self.doc.set(
            &entry.key("tty"),
            format!("{},{}", info.tty_major, info.tty_minor),
        );
        self.doc.set(&entry.key("utime"), info.utime);
        self.doc.set(&entry.key("stime"), info.stime);
        self.doc.set(&entry.key("cutime"), info.cutime);
        self.doc.set(&entry.key("cstime"), info.cstime);
        Ok(true)
    }

    /// Raw configuration value.
    pub fn get_config(&self, key: &str) -> Option<String> {
        self.config.get(key)
    }

    /// Raw configuration value with a fallback for empty or missing.
    pub fn get_config_or(&self, key: &str, fallback: &str) -> String {
        self.config.get_or(key, fallback)
    }

    /// The configuration provider itself, for typed getters.
    pub fn config(&self) -> &ConfigProvider {
        self.config
    }

    /// Full path of `filename` inside the daemon cache directory.
    ///
    /// The directory is created on first use; `None` when no cache path
    /// is configured or the directory cannot be created.
    pub fn cache_path(&self, filename: &str) -> Option<PathBuf> {
        cache_file(self.config, filename)
    }
}

/// Resolve `filename` inside the configured cache directory, creating the
/// directory on demand.
pub fn cache_file(config: &ConfigProvider, filename: &str) -> Option<PathBuf> {
    let base = config.get("cache-path").filter(|p| !p.is_empty())?;
    let base = PathBuf::from(base);
    if let Err(e) = std::fs::create_dir_all(&base) {
        warn!(path = %base.display(), "cannot create cache directory: {e}");
        return None;
    }
    Some(base.join(filename))
}
