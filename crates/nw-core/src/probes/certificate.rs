//! Certificate probe: TLS certificate expiry for configured domains.
//!
//! Domains are declared in numbered definition files
//! (`NN-<domain>.conf`, two leading digits fix the check order) under
//! the certificates directory, each naming a `domain=`. The expiry date
//! comes from an `openssl s_client` handshake against the domain; the
//! warning ladder is configurable as `days/priority` pairs.
//!
//! Transient fetch failures are memoized per domain so a blip does not
//! page anyone: the first failure reports at 75 and only a failure
//! persisting past five hours escalates to 100.

use crate::epoch_now;
use crate::host::HostServices;
use crate::registry::Probe;
use chrono::NaiveDateTime;
use nw_common::kvfile::KvFile;
use nw_common::{NodePath, Priority, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Command;
use tracing::{debug, error};

const DEFAULT_CERTIFICATE_PATH: &str = "/etc/nodewatch/certificates";
const DEFAULT_REQUIRED_FLAG: &str = "/run/certificate-required";

/// How long a fetch failure may persist before it is critical.
const ACCESS_ERROR_GRACE: i64 = 5 * 3_600;

/// Domain definition files carry a two-digit ordering prefix.
static DEFINITION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9][0-9]-.*\.conf$").expect("definition pattern is valid"));

type DelayLadder = BTreeMap<i64, Priority>;

pub struct CertificateProbe {
    /// notAfter epoch per domain; `None` when the fetch failed.
    checker: Box<dyn Fn(&str) -> Option<i64> + Send>,
    /// Last fetch failure per domain.
    access_errors: HashMap<String, i64>,
    /// Throttle for the invalid-delays configuration warning.
    last_delay_warning: i64,
}

impl CertificateProbe {
    pub fn new() -> Self {
        Self {
            checker: Box::new(openssl_not_after),
            access_errors: HashMap::new(),
            last_delay_warning: 0,
        }
    }

    #[cfg(test)]
    fn with_checker(checker: impl Fn(&str) -> Option<i64> + Send + 'static) -> Self {
        Self {
            checker: Box::new(checker),
            access_errors: HashMap::new(),
            last_delay_warning: 0,
        }
    }
}

impl Default for CertificateProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for CertificateProbe {
    fn name(&self) -> &'static str {
        "certificate"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let e = NodePath::root().key("certificate");
        let now = epoch_now();

        // renewal flag raised by the certificate tooling
        let flag_file = host.get_config_or("certificate-required-file", DEFAULT_REQUIRED_FLAG);
        if Path::new(&flag_file).exists() {
            host.doc().set(&e.key("renewal_required"), true);
            host.append_error(&e, "certificate", "certificate renewal is required.", 55)?;
        }

        // delays are re-read each tick; the administrator may adjust
        // them while we run
        let delays = self.parse_delays(
            &host.get_config("certificate-warning-delays").unwrap_or_default(),
            now,
        );

        let certificate_path = host.get_config_or("certificate-path", DEFAULT_CERTIFICATE_PATH);
        let today = now / 86_400;

        for domain in load_domains(Path::new(&certificate_path)) {
            let entry = host.doc().push(&e.key("domain"));
            host.doc().set(&entry.key("name"), domain.as_str());

            match (self.checker)(&domain) {
                Some(not_after) => {
                    self.access_errors.remove(&domain);
                    host.doc().set(&entry.key("not_after"), not_after);

                    let days_left = not_after / 86_400 - today;
                    if days_left <= 0 {
                        host.append_error(
                            &e,
                            "certificate",
                            &format!("Certificate for domain \"{domain}\" has expired."),
                            100,
                        )?;
                    } else if let Some((_, priority)) =
                        delays.range(days_left..).next()
                    {
                        host.append_error(
                            &e,
                            "certificate",
                            &format!(
                                "Certificate for domain \"{domain}\" will expire in \
                                 {days_left} day{}.",
                                if days_left == 1 { "" } else { "s" }
                            ),
                            *priority,
                        )?;
                    }
                }
                None => {
                    // memoized so one blip is cheap and a lasting
                    // failure escalates
                    let escalate = match self.access_errors.get(&domain) {
                        Some(first) if now - first <= ACCESS_ERROR_GRACE => continue,
                        Some(_) => true,
                        None => false,
                    };
                    self.access_errors.insert(domain.clone(), now);
                    host.doc().set(&entry.key("error"), "unreachable");
                    host.append_error(
                        &e,
                        "certificate",
                        &format!("Failed loading certificate of domain \"{domain}\"."),
                        if escalate { 100 } else { 75 },
                    )?;
                }
            }
        }

        Ok(())
    }
}

impl CertificateProbe {
    /// Parse `days/priority,...` into the warning ladder.
    ///
    /// Invalid entries are dropped with a log line at most once a day;
    /// an empty result falls back to the builtin ladder.
    fn parse_delays(&mut self, raw: &str, now: i64) -> DelayLadder {
        let mut delays = DelayLadder::new();
        let mut invalid: Vec<&str> = Vec::new();

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((days_str, priority_str)) = part.split_once('/') else {
                invalid.push(part);
                continue;
            };
            let Ok(days) = days_str.trim().parse::<i64>() else {
                invalid.push(part);
                continue;
            };
            // allow up to ten years
            if days <= 0 || days > 366 * 10 {
                invalid.push(part);
                continue;
            }
            let Ok(priority) = priority_str.trim().parse::<Priority>() else {
                invalid.push(part);
                continue;
            };
            if !(0..=100).contains(&priority) {
                invalid.push(part);
                continue;
            }
            delays.insert(days, priority);
        }

        if !invalid.is_empty() && now - self.last_delay_warning >= 86_400 {
            self.last_delay_warning = now;
            error!(
                "invalid certificate warning delays ignored: {}; expected \
                 comma-separated days/priority pairs",
                invalid.join(", ")
            );
        }

        if delays.is_empty() {
            delays.insert(7, 100);
            delays.insert(14, 85);
            delays.insert(30, 45);
        }
        delays
    }
}

/// Domains from the numbered definition files, in file order.
fn load_domains(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(path = %dir.display(), "no certificate definitions directory");
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| DEFINITION_NAME.is_match(name))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut domains = Vec::new();
    for path in paths {
        if let Ok(file) = KvFile::load(&path) {
            if let Some(domain) = file.get("domain").filter(|d| !d.is_empty()) {
                domains.push(domain.to_string());
            }
        }
    }
    domains
}

/// Fetch the certificate's notAfter epoch with the openssl tooling.
fn openssl_not_after(domain: &str) -> Option<i64> {
    let handshake = Command::new("sh")
        .arg("-c")
        .arg(format!(
            "openssl s_client -servername {domain} -connect {domain}:443 </dev/null \
             2>/dev/null | openssl x509 -noout -enddate"
        ))
        .output()
        .ok()?;
    if !handshake.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&handshake.stdout);
    parse_not_after(&text)
}

/// Parse `notAfter=May 30 12:00:00 2026 GMT`.
fn parse_not_after(text: &str) -> Option<i64> {
    let line = text
        .lines()
        .find_map(|line| line.trim().strip_prefix("notAfter="))?;
    let parsed = NaiveDateTime::parse_from_str(line.trim().trim_end_matches(" GMT"), "%b %e %H:%M:%S %Y").ok()?;
    Some(parsed.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::Document;
    use nw_config::ConfigProvider;

    #[test]
    fn test_parse_not_after() {
        let epoch = parse_not_after("notAfter=May 30 12:00:00 2026 GMT\n").unwrap();
        // 2026-05-30T12:00:00Z
        assert_eq!(epoch, 1_780_142_400);
        assert!(parse_not_after("garbage").is_none());
    }

    #[test]
    fn test_parse_delays() {
        let mut probe = CertificateProbe::with_checker(|_| None);
        let delays = probe.parse_delays("5/95, 20/50", 0);
        assert_eq!(delays.get(&5), Some(&95));
        assert_eq!(delays.get(&20), Some(&50));

        // invalid entries are dropped, defaults restored when all fail
        let delays = probe.parse_delays("bad, -3/10, 5/200", 0);
        assert_eq!(delays.get(&7), Some(&100));
        assert_eq!(delays.get(&14), Some(&85));
        assert_eq!(delays.get(&30), Some(&45));

        let delays = probe.parse_delays("", 0);
        assert_eq!(delays.len(), 3);
    }

    #[test]
    fn test_definition_name_pattern() {
        assert!(DEFINITION_NAME.is_match("10-example.com.conf"));
        assert!(DEFINITION_NAME.is_match("00-a.conf"));
        assert!(!DEFINITION_NAME.is_match("example.com.conf"));
        assert!(!DEFINITION_NAME.is_match("1-example.com.conf"));
        assert!(!DEFINITION_NAME.is_match("10-example.com.conf~"));
    }

    fn setup(dir: &Path, domain: &str) -> ConfigProvider {
        std::fs::write(
            dir.join("10-domain.conf"),
            format!("domain={domain}\n"),
        )
        .unwrap();
        let config = ConfigProvider::new();
        config.set("certificate-path", dir.to_str().unwrap());
        config.set("certificate-required-file", "/nonexistent/flag");
        config.set("cache-path", "");
        config
    }

    fn tick(probe: &mut CertificateProbe, config: &ConfigProvider) -> Document {
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, config, &state);
            probe.on_tick(&mut host).unwrap();
        }
        doc
    }

    #[test]
    fn test_expired_certificate_critical() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), "expired.example.com");
        let yesterday = epoch_now() - 86_400;
        let mut probe = CertificateProbe::with_checker(move |_| Some(yesterday));

        let doc = tick(&mut probe, &config);
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 100);
    }

    #[test]
    fn test_expiring_soon_uses_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), "soon.example.com");
        // expires in ~10 days -> the 14-day tier (priority 85)
        let soon = epoch_now() + 10 * 86_400;
        let mut probe = CertificateProbe::with_checker(move |_| Some(soon));

        let doc = tick(&mut probe, &config);
        assert_eq!(doc.max_error_priority(), 85);
    }

    #[test]
    fn test_distant_expiry_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), "fine.example.com");
        let distant = epoch_now() + 90 * 86_400;
        let mut probe = CertificateProbe::with_checker(move |_| Some(distant));

        let doc = tick(&mut probe, &config);
        assert_eq!(doc.error_count(), 0);
    }

    #[test]
    fn test_fetch_failure_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path(), "down.example.com");
        let mut probe = CertificateProbe::with_checker(|_| None);

        // first failure: priority 75
        let doc = tick(&mut probe, &config);
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 75);

        // second failure within the grace window: quiet
        let doc = tick(&mut probe, &config);
        assert_eq!(doc.error_count(), 0);
    }
}
