//! The worker: the dedicated thread that drives probes on ticks.
//!
//! One worker thread exists for the lifetime of the daemon. It loads the
//! probe registry once, then sleeps on a condition variable until the
//! tick scheduler (or a shutdown request) wakes it. Pending ticks are
//! drained to zero before a run starts, so any number of ticks that
//! accumulate while a run is in progress collapse into a single
//! follow-up run.
//!
//! Probes execute sequentially on this thread and may block briefly. A
//! probe failure or panic is converted into a document-level error entry
//! at priority 90 and the remaining probes still run; nothing a probe
//! does can take the worker down.

use crate::host::{DaemonState, HostServices};
use crate::registry::Registry;
use crate::report::Reporter;
use crate::epoch_now;
use nw_common::{Document, NodePath, Result};
use nw_config::ConfigProvider;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why the worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Clean exit after a stop request.
    Stopped,
    /// The probe registry could not be loaded; the daemon must shut down.
    LoadFailed(String),
}

#[derive(Debug, Default)]
struct TickState {
    ticks: u32,
    stop: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TickState>,
    cond: Condvar,
}

/// Everything the worker thread needs, moved into it at spawn.
pub struct WorkerContext {
    pub config: Arc<ConfigProvider>,
    pub state: Arc<DaemonState>,
    pub reporter: Reporter,
    /// Thread-done notification back to the main loop.
    pub done: Sender<WorkerExit>,
}

/// Handle to the worker thread, owned by the lifecycle controller.
pub struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread. Probe loading happens on the new thread;
    /// a load failure is reported through the done channel.
    pub fn spawn(ctx: WorkerContext) -> Worker {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("nodewatch-worker".to_string())
            .spawn(move || worker_main(&thread_shared, ctx))
            .expect("spawning the worker thread cannot fail");
        Worker {
            shared,
            handle: Some(handle),
        }
    }

    /// Queue one tick and wake the worker.
    pub fn tick(&self) {
        let mut state = self.shared.state.lock().expect("tick lock poisoned");
        state.ticks += 1;
        self.shared.cond.notify_one();
    }

    /// Make sure at least one tick is pending and wake the worker.
    pub fn wake(&self) {
        let mut state = self.shared.state.lock().expect("tick lock poisoned");
        state.ticks = state.ticks.max(1);
        self.shared.cond.notify_one();
    }

    /// Request a stop. The current probe finishes; no further run starts.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().expect("tick lock poisoned");
        state.stop = true;
        self.shared.cond.notify_all();
    }

    /// Join the worker thread.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}

fn worker_main(shared: &Shared, ctx: WorkerContext) {
    let registry = match Registry::load(&ctx.config.plugins()) {
        Ok(registry) => registry,
        Err(e) => {
            error!("cannot load probe registry: {e}");
            let _ = ctx.done.send(WorkerExit::LoadFailed(e.to_string()));
            return;
        }
    };

    let mut runner = Runner::new(registry, ctx.config, ctx.state, ctx.reporter);
    while wait_next_tick(shared) {
        runner.run_once();
    }
    info!("worker thread stopping");
    let _ = ctx.done.send(WorkerExit::Stopped);
}

/// Block until a tick is pending or a stop was requested.
///
/// All pending ticks are consumed at once: if five ticks accumulated
/// while the previous run was busy, the caller performs exactly one run
/// for them.
fn wait_next_tick(shared: &Shared) -> bool {
    let mut state = shared.state.lock().expect("tick lock poisoned");
    loop {
        if state.stop {
            return false;
        }
        if state.ticks > 0 {
            state.ticks = 0;
            return true;
        }
        state = shared.cond.wait(state).expect("tick lock poisoned");
    }
}

/// One run of all probes: owns the registry and the reporting side.
pub(crate) struct Runner {
    registry: Registry,
    config: Arc<ConfigProvider>,
    state: Arc<DaemonState>,
    reporter: Reporter,
    warned_empty: bool,
}

impl Runner {
    pub(crate) fn new(
        registry: Registry,
        config: Arc<ConfigProvider>,
        state: Arc<DaemonState>,
        reporter: Reporter,
    ) -> Self {
        Self {
            registry,
            config,
            state,
            reporter,
            warned_empty: false,
        }
    }

    /// Build one result document, persist it, and run the reporting gate.
    ///
    /// Returns the document unless the run came out empty.
    pub(crate) fn run_once(&mut self) -> Option<Document> {
        let root = NodePath::root();
        let start_date = epoch_now();

        let mut doc = Document::new();
        doc.set(&root.key("start_date"), start_date);
        doc.clear_errors();

        for probe in self.registry.ordered_mut() {
            let name = probe.name();
            debug!(probe = name, "running probe");
            let config = &self.config;
            let state = &self.state;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut host = HostServices::new(&mut doc, config, state);
                probe.on_tick(&mut host)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // the failed probe counts as a finding of its own
                    let _ = doc.append_error(
                        &root,
                        name,
                        &format!("probe failed: {e}"),
                        90,
                    );
                }
                Err(panic) => {
                    let _ = doc.append_error(
                        &root,
                        name,
                        &format!("probe panicked: {}", panic_message(panic.as_ref())),
                        90,
                    );
                }
            }
        }

        doc.set(&root.key("end_date"), epoch_now());

        if doc.root_len() <= 2 {
            // nothing but the timestamps: no probe wrote anything
            if !self.warned_empty {
                self.warned_empty = true;
                error!(
                    "probe run produced a completely empty result; \
                     is the configured plugins list empty?"
                );
            }
            return None;
        }

        self.persist(&doc, start_date);

        if doc.error_count() > 0 {
            self.reporter
                .maybe_report(&doc, start_date, epoch_now(), &self.config, &self.state);
        }

        Some(doc)
    }

    /// Write the run into the snapshot ring.
    ///
    /// The slot index is the run's minute start modulo the retention
    /// period, so the ring covers exactly the retention window and old
    /// slots are overwritten in place.
    fn persist(&self, doc: &Document, start_date: i64) {
        let Some(data_path) = self.config.get("data-path").filter(|p| !p.is_empty()) else {
            return;
        };
        let period = self.config.statistics_period() as i64;
        let slot = ((start_date / 60) * 60).rem_euclid(period);

        let dir = PathBuf::from(data_path);
        let write = |dir: &PathBuf| -> Result<()> {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join(format!("{slot}.json")), doc.to_json())?;
            Ok(())
        };
        if let Err(e) = write(&dir) {
            warn!(path = %dir.display(), slot, "could not persist run snapshot: {e}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::MemoryTransport;
    use crate::host::HostServices;
    use crate::registry::Probe;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingProbe {
        runs: Arc<AtomicU32>,
        delay: Duration,
    }

    impl Probe for CountingProbe {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let path = NodePath::root().key("counting");
            host.doc().set(&path.key("ran"), true);
            Ok(())
        }
    }

    struct WritingProbe {
        name: &'static str,
    }

    impl Probe for WritingProbe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
            let path = NodePath::root().key(self.name);
            host.doc().set(&path.key("ok"), true);
            Ok(())
        }
    }

    struct FailingProbe;

    impl Probe for FailingProbe {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn on_tick(&mut self, _host: &mut HostServices<'_>) -> Result<()> {
            Err(nw_common::Error::ProbeFailure {
                probe: "failing".into(),
                message: "could not read input".into(),
            })
        }
    }

    struct PanickingProbe;

    impl Probe for PanickingProbe {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn on_tick(&mut self, _host: &mut HostServices<'_>) -> Result<()> {
            panic!("index out of bounds");
        }
    }

    fn test_runner(probes: Vec<Box<dyn Probe>>) -> (Runner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigProvider::new());
        config.set("data-path", dir.path().to_str().unwrap());
        config.set("cache-path", "");
        let registry = Registry::from_probes(probes).unwrap();
        let runner = Runner::new(
            registry,
            config,
            Arc::new(DaemonState::new(epoch_now())),
            Reporter::new(Box::<MemoryTransport>::default()),
        );
        (runner, dir)
    }

    fn spawn_test_worker(
        probes: Vec<Box<dyn Probe>>,
    ) -> (Worker, std::sync::mpsc::Receiver<WorkerExit>, tempfile::TempDir) {
        let (runner, dir) = test_runner(probes);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let mut runner = runner;
        let handle = std::thread::Builder::new()
            .name("test-worker".to_string())
            .spawn(move || {
                while wait_next_tick(&thread_shared) {
                    runner.run_once();
                }
                let _ = done_tx.send(WorkerExit::Stopped);
            })
            .unwrap();
        (
            Worker {
                shared,
                handle: Some(handle),
            },
            done_rx,
            dir,
        )
    }

    #[test]
    fn test_run_sets_dates_and_probe_output() {
        let (mut runner, _dir) = test_runner(vec![Box::new(WritingProbe { name: "cpu" })]);
        let doc = runner.run_once().expect("non-empty run");
        let root = NodePath::root();
        assert!(doc.get(&root.key("start_date")).is_some());
        assert!(doc.get(&root.key("end_date")).is_some());
        assert!(doc.get(&root.key("cpu").key("ok")).is_some());
    }

    #[test]
    fn test_empty_run_skipped() {
        let (mut runner, dir) = test_runner(vec![]);
        assert!(runner.run_once().is_none());
        // nothing persisted
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_failure_isolation() {
        // scenario D: probes before and after the failing one still run
        let (mut runner, _dir) = test_runner(vec![
            Box::new(WritingProbe { name: "before" }),
            Box::new(FailingProbe),
            Box::new(WritingProbe { name: "after" }),
        ]);
        let doc = runner.run_once().expect("non-empty run");
        let root = NodePath::root();
        assert!(doc.get(&root.key("before").key("ok")).is_some());
        assert!(doc.get(&root.key("after").key("ok")).is_some());

        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 90);
        let entry = doc.get(&root.key("error").at(0)).unwrap();
        assert_eq!(
            entry.get_key("plugin_name").and_then(nw_common::Value::as_str),
            Some("failing")
        );
    }

    #[test]
    fn test_panic_isolation() {
        let (mut runner, _dir) = test_runner(vec![
            Box::new(PanickingProbe),
            Box::new(WritingProbe { name: "after" }),
        ]);
        let doc = runner.run_once().expect("non-empty run");
        let root = NodePath::root();
        assert!(doc.get(&root.key("after").key("ok")).is_some());
        assert_eq!(doc.max_error_priority(), 90);
        let entry = doc.get(&root.key("error").at(0)).unwrap();
        let message = entry
            .get_key("message")
            .and_then(nw_common::Value::as_str)
            .unwrap();
        assert!(message.contains("index out of bounds"));
    }

    #[test]
    fn test_persist_ring_slot() {
        let (mut runner, dir) = test_runner(vec![Box::new(WritingProbe { name: "cpu" })]);
        let doc = runner.run_once().expect("non-empty run");
        let root = NodePath::root();
        let start = doc
            .get(&root.key("start_date"))
            .and_then(nw_common::Value::as_i64)
            .unwrap();

        let period = 604_800_i64;
        let slot = ((start / 60) * 60).rem_euclid(period);
        let path = dir.path().join(format!("{slot}.json"));
        assert!(path.is_file(), "expected {path:?}");
        let persisted: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(persisted["cpu"]["ok"], serde_json::json!(true));
    }

    #[test]
    fn test_tick_collapse() {
        // scenario C: ticks queued during a slow run collapse into one
        let runs = Arc::new(AtomicU32::new(0));
        let (worker, done_rx, _dir) = spawn_test_worker(vec![Box::new(CountingProbe {
            runs: Arc::clone(&runs),
            delay: Duration::from_millis(150),
        })]);

        worker.tick();
        // wait until run A is actually inside the probe
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1, "run A should have started");
        // pile up ticks while run A sleeps in the probe
        for _ in 0..5 {
            worker.tick();
        }

        // wait for the queue to drain
        std::thread::sleep(Duration::from_millis(500));
        let mut worker = worker;
        worker.stop();
        worker.join();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)), Ok(WorkerExit::Stopped));

        // run A plus exactly one collapsed run B
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_without_tick_exits_promptly() {
        let (worker, done_rx, _dir) =
            spawn_test_worker(vec![Box::new(WritingProbe { name: "cpu" })]);
        let mut worker = worker;
        worker.stop();
        worker.join();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)), Ok(WorkerExit::Stopped));
    }

    #[test]
    fn test_wake_forces_single_tick() {
        let runs = Arc::new(AtomicU32::new(0));
        let (worker, done_rx, _dir) = spawn_test_worker(vec![Box::new(CountingProbe {
            runs: Arc::clone(&runs),
            delay: Duration::ZERO,
        })]);
        worker.wake();
        worker.wake(); // still only one pending tick
        std::thread::sleep(Duration::from_millis(200));
        let mut worker = worker;
        worker.stop();
        worker.join();
        let _ = done_rx.recv_timeout(Duration::from_secs(1));
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_spawned_worker_load_failure_reported() {
        let config = Arc::new(ConfigProvider::new());
        config.set("plugins", "cpu,definitely-not-a-probe");
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let mut worker = Worker::spawn(WorkerContext {
            config,
            state: Arc::new(DaemonState::new(0)),
            reporter: Reporter::new(Box::<MemoryTransport>::default()),
            done: done_tx,
        });
        let exit = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(exit, WorkerExit::LoadFailed(_)));
        worker.join();
    }
}
