//! The cluster-bus message endpoint, specified at its interface.
//!
//! The bus client itself (socket handling, reconnection, registration
//! protocol) lives outside the core; the core consumes [`BusEvent`]s and
//! registers/unregisters through the [`BusConnection`] trait. The
//! channel-backed implementation is what the daemon wires the external
//! client into, and what tests drive directly.

use nw_common::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::{debug, warn};

/// A raw message from the bus: a command and its string parameters.
#[derive(Debug, Clone, Default)]
pub struct BusMessage {
    pub command: String,
    pub params: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    fn required(&self, name: &str) -> Result<String> {
        self.params.get(name).cloned().ok_or_else(|| Error::MessageMalformed {
            command: self.command.clone(),
            field: name.to_string(),
        })
    }
}

/// Resource-usage record forwarded by another process on the node.
///
/// Serialized as-is when persisted; field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RusageMessage {
    pub process_name: String,
    pub pid: String,
    pub user_time: String,
    pub system_time: String,
    pub maxrss: String,
    pub minor_page_fault: String,
    pub major_page_fault: String,
    pub in_block: String,
    pub out_block: String,
    pub volontary_context_switches: String,
    pub involontary_context_switches: String,
}

/// Lifecycle and data events the core consumes from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Registration and settings are complete; start ticking.
    Ready,
    /// Graceful shutdown. `quitting` when the bus itself is going down
    /// (no UNREGISTER possible).
    Stop { quitting: bool },
    /// Restart requested after a configuration change.
    ReloadConfig,
    /// Resource usage forwarded from another local process.
    Rusage(RusageMessage),
    /// A named setting changed; drop cached values for it.
    ConfigChanged { name: String },
    /// The endpoint gained or lost its bus connection.
    ConnectionChanged { connected: bool },
}

impl BusEvent {
    /// Decode a raw message.
    ///
    /// Unknown commands decode to `None` (they belong to bus layers the
    /// core does not care about). Known commands with missing fields fail
    /// with `MessageMalformed`; the caller logs and drops those.
    pub fn parse(message: &BusMessage) -> Result<Option<BusEvent>> {
        let event = match message.command.as_str() {
            "READY" => Some(BusEvent::Ready),
            "STOP" => Some(BusEvent::Stop { quitting: false }),
            "QUITTING" => Some(BusEvent::Stop { quitting: true }),
            "RELOADCONFIG" => Some(BusEvent::ReloadConfig),
            "CONFIGCHANGED" => Some(BusEvent::ConfigChanged {
                name: message.required("name")?,
            }),
            "RUSAGE" => Some(BusEvent::Rusage(RusageMessage {
                process_name: message.required("process_name")?,
                pid: message.required("pid")?,
                user_time: message.required("user_time")?,
                system_time: message.required("system_time")?,
                maxrss: message.required("maxrss")?,
                minor_page_fault: message.required("minor_page_fault")?,
                major_page_fault: message.required("major_page_fault")?,
                in_block: message.required("in_block")?,
                out_block: message.required("out_block")?,
                volontary_context_switches: message.required("volontary_context_switches")?,
                involontary_context_switches: message.required("involontary_context_switches")?,
            })),
            other => {
                debug!(command = other, "ignoring bus command");
                None
            }
        };
        Ok(event)
    }
}

/// On-disk shape of a persisted rusage record: the message wrapped in a
/// one-element object, stamped with the time it arrived.
#[derive(Serialize)]
struct RusageRecord<'a> {
    rusage: StampedRusage<'a>,
}

#[derive(Serialize)]
struct StampedRusage<'a> {
    #[serde(flatten)]
    message: &'a RusageMessage,
    date: i64,
}

/// Persist one RUSAGE record under `<data_path>/rusage/`.
///
/// Written to a 24-slot ring keyed by hour of day:
/// `<process_name>-<hour>.json`.
pub fn record_usage(data_path: &Path, message: &RusageMessage, now: i64) -> Result<PathBuf> {
    let dir = data_path.join("rusage");
    std::fs::create_dir_all(&dir)?;

    let record = RusageRecord {
        rusage: StampedRusage { message, date: now },
    };
    let json = serde_json::to_string(&record)?;

    let hour = (now / 3_600).rem_euclid(24);
    let path = dir.join(format!("{}-{hour}.json", message.process_name));
    std::fs::write(&path, json)?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Connection interface
// ---------------------------------------------------------------------------

/// The core's view of the bus client.
pub trait BusConnection: Send {
    /// Register the service with the bus.
    fn register(&mut self, service: &str) -> Result<()>;

    /// Unregister cleanly. Skipped when the connection is already gone.
    fn unregister(&mut self, service: &str) -> Result<()>;

    /// Wait up to `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> Option<BusEvent>;
}

/// Channel-backed connection: the external bus client pushes decoded
/// events through a [`BusHandle`], the main loop drains them here.
pub struct ChannelBus {
    rx: Receiver<BusEvent>,
    handle: BusHandle,
}

/// Producer side of a [`ChannelBus`].
#[derive(Clone)]
pub struct BusHandle {
    tx: Sender<BusEvent>,
}

impl BusHandle {
    /// Push a decoded event to the main loop.
    pub fn send(&self, event: BusEvent) {
        // the receiver only disappears during shutdown
        let _ = self.tx.send(event);
    }

    /// Decode a raw message and push it; malformed messages are logged
    /// and dropped here, at the endpoint boundary.
    pub fn deliver(&self, message: &BusMessage) {
        match BusEvent::parse(message) {
            Ok(Some(event)) => self.send(event),
            Ok(None) => {}
            Err(e) => warn!(command = %message.command, "dropping bus message: {e}"),
        }
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: BusHandle { tx },
        }
    }

    /// Producer handle for the external bus client (and tests).
    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConnection for ChannelBus {
    fn register(&mut self, service: &str) -> Result<()> {
        debug!(service, "registering with the bus");
        Ok(())
    }

    fn unregister(&mut self, service: &str) -> Result<()> {
        debug!(service, "unregistering from the bus");
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<BusEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
