//! The lifecycle controller: owns the main loop, the shutdown ordering,
//! and the exit-code selection.
//!
//! Exactly two threads matter here: this one (event loop, signals, bus
//! messages) and the worker (probe execution). The main loop waits on
//! the bus with a bounded timeout so it can poll the SIGINT flag and the
//! tick deadline; it never runs a probe itself.

use crate::bus::{record_usage, BusConnection, BusEvent};
use crate::email::EmailTransport;
use crate::exit_codes::ExitCode;
use crate::host::DaemonState;
use crate::report::Reporter;
use crate::scheduler::TickScheduler;
use crate::worker::{Worker, WorkerContext, WorkerExit};
use crate::{epoch_now, SERVICE_NAME};
use nw_config::ConfigProvider;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Longest single wait in the main loop; bounds SIGINT reaction time.
const POLL_CAP: Duration = Duration::from_millis(500);

/// The nodewatch daemon.
pub struct Server {
    config: Arc<ConfigProvider>,
    state: Arc<DaemonState>,
    bus: Box<dyn BusConnection>,
    transport: Option<Box<dyn EmailTransport>>,
    force_restart: bool,
}

impl Server {
    pub fn new(
        config: Arc<ConfigProvider>,
        bus: Box<dyn BusConnection>,
        transport: Box<dyn EmailTransport>,
    ) -> Self {
        let state = Arc::new(DaemonState::new(epoch_now()));
        Self {
            config,
            state,
            bus,
            transport: Some(transport),
            force_restart: false,
        }
    }

    /// Run until a stop is requested; returns the process exit code.
    pub fn run(&mut self) -> ExitCode {
        info!(
            host = %self.state.hostname,
            "------------------------------------ {SERVICE_NAME} started"
        );

        // force tier validation early so clamp warnings appear at startup
        let _ = self.config.report_tiers();

        if let Err(e) = self.bus.register(SERVICE_NAME) {
            error!("cannot register with the bus: {e}");
            return ExitCode::Fatal;
        }

        // SIGINT behaves exactly like a STOP message
        let interrupted = Arc::new(AtomicBool::new(false));
        let sigint = signal_hook::flag::register(
            signal_hook::consts::SIGINT,
            Arc::clone(&interrupted),
        );
        if let Err(e) = &sigint {
            warn!("cannot install SIGINT handler: {e}");
        }

        let (done_tx, done_rx) = mpsc::channel();
        let transport = self.transport.take().expect("run is called once");
        let mut worker = Worker::spawn(WorkerContext {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            reporter: Reporter::new(transport),
            done: done_tx,
        });

        let mut scheduler = TickScheduler::new();
        let mut quitting = false;
        let mut fatal = false;

        loop {
            if interrupted.swap(false, Ordering::Relaxed) {
                info!("interrupt received, stopping");
                break;
            }

            let now = Instant::now();
            let timeout = scheduler
                .timeout(now)
                .map(|t| t.min(POLL_CAP))
                .unwrap_or(POLL_CAP);

            if let Some(event) = self.bus.next_event(timeout) {
                match event {
                    BusEvent::Ready => {
                        info!("settings ready, enabling the tick scheduler");
                        scheduler.enable(Instant::now());
                    }
                    BusEvent::Stop { quitting: q } => {
                        info!(quitting = q, "stop requested");
                        quitting = q;
                        break;
                    }
                    BusEvent::ReloadConfig => {
                        info!("configuration reload requested, restarting");
                        self.force_restart = true;
                        break;
                    }
                    BusEvent::Rusage(message) => {
                        self.handle_rusage(&message);
                    }
                    BusEvent::ConfigChanged { name } => {
                        info!(setting = %name, "configuration changed");
                        self.config.invalidate(&name);
                    }
                    BusEvent::ConnectionChanged { connected } => {
                        self.state.set_bus_connected(connected, epoch_now());
                    }
                }
            }

            let period = Duration::from_secs(self.config.statistics_frequency());
            if scheduler.fire_due(Instant::now(), period) {
                worker.tick();
            }

            match done_rx.try_recv() {
                Ok(WorkerExit::LoadFailed(message)) => {
                    error!("worker could not start: {message}");
                    fatal = true;
                    break;
                }
                Ok(WorkerExit::Stopped) => {
                    // the worker never stops unrequested
                    error!("worker thread exited unexpectedly");
                    fatal = true;
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }

        // ordered shutdown: stop the worker first, then leave the bus
        scheduler.disable();
        worker.stop();
        worker.join();
        wait_worker_done(&done_rx);

        // no point unregistering when the bus is quitting or the
        // connection is already gone
        if !quitting && self.state.bus_is_connected() {
            if let Err(e) = self.bus.unregister(SERVICE_NAME) {
                warn!("bus unregister failed: {e}");
            }
        }

        if let Ok(id) = sigint {
            signal_hook::low_level::unregister(id);
        }

        info!("{SERVICE_NAME} stopped");
        if fatal {
            ExitCode::Fatal
        } else if self.force_restart {
            ExitCode::RestartRequested
        } else {
            ExitCode::Clean
        }
    }

    fn handle_rusage(&self, message: &crate::bus::RusageMessage) {
        let Some(data_path) = self.config.get("data-path").filter(|p| !p.is_empty()) else {
            return;
        };
        match record_usage(&PathBuf::from(data_path), message, epoch_now()) {
            Ok(path) => {
                tracing::debug!(process = %message.process_name, path = %path.display(),
                    "recorded rusage");
            }
            Err(e) => warn!(process = %message.process_name, "could not record rusage: {e}"),
        }
    }
}

fn wait_worker_done(done_rx: &Receiver<WorkerExit>) {
    // the join above already synchronized with the thread; this only
    // drains the notification so it is not mistaken for a late failure
    let _ = done_rx.try_recv();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusHandle, ChannelBus};
    use crate::email::MemoryTransport;

    fn test_server(plugins: &str) -> (Server, BusHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigProvider::new());
        config.set("plugins", plugins);
        config.set("data-path", dir.path().join("data").to_str().unwrap());
        config.set("cache-path", dir.path().join("cache").to_str().unwrap());
        let bus = ChannelBus::new();
        let handle = bus.handle();
        let server = Server::new(
            config,
            Box::new(bus),
            Box::<MemoryTransport>::default(),
        );
        (server, handle, dir)
    }

    #[test]
    fn test_stop_exits_clean() {
        let (mut server, handle, _dir) = test_server("memory");
        handle.send(BusEvent::Stop { quitting: false });
        assert_eq!(server.run(), ExitCode::Clean);
    }

    #[test]
    fn test_quitting_exits_clean() {
        let (mut server, handle, _dir) = test_server("memory");
        handle.send(BusEvent::Stop { quitting: true });
        assert_eq!(server.run(), ExitCode::Clean);
    }

    #[test]
    fn test_reload_config_requests_restart() {
        let (mut server, handle, _dir) = test_server("memory");
        handle.send(BusEvent::ReloadConfig);
        assert_eq!(server.run(), ExitCode::RestartRequested);
    }

    #[test]
    fn test_bad_probe_selection_is_fatal() {
        let (mut server, handle, _dir) = test_server("memory,nonexistent");
        // no stop needed: the load failure must end the loop by itself
        let _ = handle;
        assert_eq!(server.run(), ExitCode::Fatal);
    }

    #[test]
    fn test_rusage_recorded_through_event_loop() {
        let (mut server, handle, dir) = test_server("memory");
        handle.send(BusEvent::Rusage(crate::bus::RusageMessage {
            process_name: "svc".into(),
            pid: "123".into(),
            user_time: "1".into(),
            system_time: "2".into(),
            maxrss: "3".into(),
            minor_page_fault: "4".into(),
            major_page_fault: "5".into(),
            in_block: "6".into(),
            out_block: "7".into(),
            volontary_context_switches: "8".into(),
            involontary_context_switches: "9".into(),
        }));
        handle.send(BusEvent::Stop { quitting: false });
        assert_eq!(server.run(), ExitCode::Clean);

        let rusage_dir = dir.path().join("data").join("rusage");
        let entries: Vec<_> = std::fs::read_dir(&rusage_dir)
            .expect("rusage directory created")
            .flatten()
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("svc-") && name.ends_with(".json"));
    }

    #[test]
    fn test_connection_changes_tracked() {
        let (mut server, handle, _dir) = test_server("memory");
        let state = Arc::clone(&server.state);
        handle.send(BusEvent::ConnectionChanged { connected: true });
        handle.send(BusEvent::Stop { quitting: false });
        assert_eq!(server.run(), ExitCode::Clean);
        assert!(state.bus_is_connected());
    }
}
