//! Report email rendering and delivery.
//!
//! The reporting gate composes an [`EmailMessage`]; delivery goes through
//! the [`EmailTransport`] trait so the mail system stays an external
//! collaborator. The default transport pipes the rendered message to the
//! local `sendmail -t`, synchronously, the same way probes invoke other
//! system tools.

use nw_common::Result;
use std::io::Write as _;
use std::process::{Command, Stdio};
use tracing::debug;

/// One attachment of a report email.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Extra part headers (e.g. the run start date).
    pub headers: Vec<(String, String)>,
    pub data: String,
}

/// A composed report email.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Extra top-level headers (version tag, priority markers).
    pub headers: Vec<(String, String)>,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

const BOUNDARY: &str = "=_nodewatch_report_part";

impl EmailMessage {
    /// Render to an RFC 2822 message suitable for `sendmail -t`.
    ///
    /// Rendering is deterministic for a fixed message: the boundary is a
    /// constant and parts appear in composition order.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        header(&mut out, "From", &self.from);
        header(&mut out, "To", &self.to);
        header(&mut out, "Subject", &self.subject);
        header(&mut out, "MIME-Version", "1.0");
        for (name, value) in &self.headers {
            header(&mut out, name, value);
        }
        header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{BOUNDARY}\""),
        );
        out.push_str("\r\n");

        // body part
        out.push_str(&format!("--{BOUNDARY}\r\n"));
        header(&mut out, "Content-Type", "text/html; charset=utf-8");
        header(&mut out, "Content-Transfer-Encoding", "8bit");
        out.push_str("\r\n");
        out.push_str(&self.html_body);
        out.push_str("\r\n");

        for attachment in &self.attachments {
            out.push_str(&format!("--{BOUNDARY}\r\n"));
            header(
                &mut out,
                "Content-Type",
                &format!(
                    "{}; name=\"{}\"",
                    attachment.content_type, attachment.filename
                ),
            );
            header(
                &mut out,
                "Content-Disposition",
                &format!("attachment; filename=\"{}\"", attachment.filename),
            );
            header(&mut out, "Content-Transfer-Encoding", "8bit");
            for (name, value) in &attachment.headers {
                header(&mut out, name, value);
            }
            out.push_str("\r\n");
            out.push_str(&attachment.data);
            out.push_str("\r\n");
        }

        out.push_str(&format!("--{BOUNDARY}--\r\n"));
        out
    }
}

fn header(out: &mut String, name: &str, value: &str) {
    // header values are single-line; anything else would corrupt the message
    let value = value.replace(['\r', '\n'], " ");
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value);
    out.push_str("\r\n");
}

/// Delivery of composed report emails.
pub trait EmailTransport: Send {
    fn send(&mut self, message: &EmailMessage) -> Result<()>;
}

/// Default transport: pipe to the local `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    command: String,
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self {
            command: "sendmail".to_string(),
        }
    }
}

impl SendmailTransport {
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl EmailTransport for SendmailTransport {
    fn send(&mut self, message: &EmailMessage) -> Result<()> {
        debug!(to = %message.to, subject = %message.subject, "handing report to sendmail");
        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(message.render().as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "{} exited with {status}",
                self.command
            ))
            .into());
        }
        Ok(())
    }
}

/// Transport that keeps sent messages in memory. Used by tests and by
/// `--dry-run` style tooling that wants the composed message without
/// delivery.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub sent: Vec<EmailMessage>,
}

impl EmailTransport for MemoryTransport {
    fn send(&mut self, message: &EmailMessage) -> Result<()> {
        self.sent.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EmailMessage {
        EmailMessage {
            from: "nodewatch@node3.example.com".into(),
            to: "admin@example.com".into(),
            subject: "nodewatch: found 2 errors on node3".into(),
            headers: vec![
                ("X-Nodewatch-Version".into(), "0.9.2".into()),
                ("X-Priority".into(), "1 (Highest)".into()),
            ],
            html_body: "<p>{\"start_date\":1}</p>".into(),
            attachments: vec![Attachment {
                filename: "nodewatch.json".into(),
                content_type: "application/json".into(),
                headers: vec![("X-Start-Date".into(), "1".into())],
                data: "{\"start_date\":1}".into(),
            }],
        }
    }

    #[test]
    fn test_render_structure() {
        let text = sample().render();
        assert!(text.starts_with("From: nodewatch@node3.example.com\r\n"));
        assert!(text.contains("To: admin@example.com\r\n"));
        assert!(text.contains("Subject: nodewatch: found 2 errors on node3\r\n"));
        assert!(text.contains("X-Nodewatch-Version: 0.9.2\r\n"));
        assert!(text.contains("Content-Type: multipart/mixed;"));
        assert!(text.contains("Content-Disposition: attachment; filename=\"nodewatch.json\""));
        assert!(text.contains("X-Start-Date: 1\r\n"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn test_render_deterministic() {
        assert_eq!(sample().render(), sample().render());
    }

    #[test]
    fn test_header_injection_flattened() {
        let mut message = sample();
        message.subject = "bad\r\nBcc: evil@example.com".into();
        let text = message.render();
        assert!(text.contains("Subject: bad Bcc: evil@example.com\r\n"));
        assert!(!text.contains("\r\nBcc:"));
    }

    #[test]
    fn test_memory_transport_records() {
        let mut transport = MemoryTransport::default();
        transport.send(&sample()).unwrap();
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0].to, "admin@example.com");
    }
}
