//! The reporting gate: decides whether a run's findings become an email
//! and bounds how often one may fire.
//!
//! The decision itself is a pure function over explicit inputs so the
//! throttling behavior is directly testable; the [`Reporter`] wraps it
//! with the persisted last-report state and the email composition.
//!
//! Throttling spans survive restarts: the time of the last emitted report
//! lives in `<cache_path>/last_email_time.txt` and is only rewritten when
//! a report actually goes out.

use crate::email::{Attachment, EmailMessage, EmailTransport};
use crate::host::{cache_file, DaemonState};
use crate::{SERVICE_NAME, VERSION};
use nw_common::{Document, Priority};
use nw_config::{ConfigProvider, ReportTiers};
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the persisted last-report file.
pub const LAST_EMAIL_FILE: &str = "last_email_time.txt";

/// Everything the gate decision depends on.
#[derive(Debug, Clone)]
pub struct GateInputs {
    /// Highest error priority of the run.
    pub max_error_priority: Priority,
    /// Current epoch seconds.
    pub now: i64,
    /// Process start epoch; reports are suppressed for the settle time
    /// after startup.
    pub process_start: i64,
    /// Epoch of the last emitted report, if any was recorded.
    pub last_report: Option<i64>,
    /// Startup grace period, seconds.
    pub settle_time: i64,
    /// Configured priority/span tiers.
    pub tiers: ReportTiers,
}

/// Outcome of the gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Emit a report; `span` is the tier span that now applies.
    Send { span: i64 },
    /// Highest priority below the low tier.
    BelowThreshold,
    /// Still within the startup settle time.
    Settling,
    /// A report went out less than one span ago.
    Throttled { span: i64, next_allowed: i64 },
}

/// The §4.6 decision procedure, side-effect free.
pub fn decide(inputs: &GateInputs) -> GateDecision {
    if inputs.max_error_priority < inputs.tiers.low.priority {
        return GateDecision::BelowThreshold;
    }

    if inputs.now - inputs.process_start < inputs.settle_time {
        return GateDecision::Settling;
    }

    let span = inputs.tiers.span_for(inputs.max_error_priority);

    if let Some(last) = inputs.last_report {
        if inputs.now - last < span {
            return GateDecision::Throttled {
                span,
                next_allowed: last + span,
            };
        }
    }

    GateDecision::Send { span }
}

/// Applies the gate to finished runs and emits report emails.
pub struct Reporter {
    transport: Box<dyn EmailTransport>,
}

impl Reporter {
    pub fn new(transport: Box<dyn EmailTransport>) -> Self {
        Self { transport }
    }

    /// Run the gate for a finished run and send a report if it passes.
    ///
    /// Called by the worker only when the run produced at least one
    /// error entry.
    pub fn maybe_report(
        &mut self,
        doc: &Document,
        start_date: i64,
        now: i64,
        config: &ConfigProvider,
        state: &DaemonState,
    ) {
        let last_email_path = cache_file(config, LAST_EMAIL_FILE);

        let inputs = GateInputs {
            max_error_priority: doc.max_error_priority(),
            now,
            process_start: state.started_at,
            last_report: last_email_path.as_deref().and_then(read_epoch_file),
            settle_time: config.error_report_settle_time() as i64,
            tiers: config.report_tiers(),
        };

        match decide(&inputs) {
            GateDecision::BelowThreshold => {
                debug!(
                    max_priority = inputs.max_error_priority,
                    "errors below the low report tier, no report"
                );
            }
            GateDecision::Settling => {
                debug!("within the startup settle time, no report");
            }
            GateDecision::Throttled { span, next_allowed } => {
                debug!(span, next_allowed, "report span not yet elapsed, no report");
            }
            GateDecision::Send { span } => {
                // record the send first so a crash mid-delivery cannot
                // produce a report storm
                if let Some(path) = &last_email_path {
                    if let Err(e) = std::fs::write(path, now.to_string()) {
                        warn!(path = %path.display(), "could not save last email time: {e}");
                    }
                }

                let Some(message) = compose_report(doc, start_date, config, state) else {
                    return;
                };
                info!(
                    errors = doc.error_count(),
                    max_priority = inputs.max_error_priority,
                    span,
                    "emitting error report"
                );
                if let Err(e) = self.transport.send(&message) {
                    warn!("report email delivery failed: {e}");
                }
            }
        }
    }
}

/// Compose the report email for a finished run.
///
/// Both the sender and the administrator address must be configured;
/// without them the report is quietly skipped.
pub fn compose_report(
    doc: &Document,
    start_date: i64,
    config: &ConfigProvider,
    state: &DaemonState,
) -> Option<EmailMessage> {
    let from = config.get("from-email").filter(|v| !v.is_empty())?;
    let to = config.get("administrator-email").filter(|v| !v.is_empty())?;

    let count = doc.error_count();
    let subject = format!(
        "{SERVICE_NAME}: found {count} error{} on {}",
        if count == 1 { "" } else { "s" },
        state.hostname
    );

    let json = doc.to_json();
    Some(EmailMessage {
        from,
        to,
        subject,
        headers: vec![
            ("X-Priority".into(), "1 (Highest)".into()),
            ("Importance".into(), "urgent".into()),
            ("X-Nodewatch-Version".into(), VERSION.into()),
        ],
        html_body: format!("<p>{json}</p>"),
        attachments: vec![Attachment {
            filename: format!("{SERVICE_NAME}.json"),
            content_type: "application/json".into(),
            headers: vec![("X-Start-Date".into(), start_date.to_string())],
            data: json,
        }],
    })
}

fn read_epoch_file(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
}
