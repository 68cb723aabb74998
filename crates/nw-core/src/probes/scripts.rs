//! Scripts probe: run administrator-provided check scripts.
//!
//! Every file under the scripts directory (READMEs excepted) is run
//! through the configured starter, `/bin/sh` by default, so scripts do
//! not need the execute bit. A script reports a problem by exiting
//! nonzero and writing to stdout; anything on stderr means the script
//! itself is broken. Both streams are appended to rotating log files
//! with a header identifying the run.

use crate::host::HostServices;
use crate::registry::Probe;
use crate::VERSION;
use chrono::{TimeZone, Utc};
use nw_common::{NodePath, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

const DEFAULT_SCRIPTS_PATH: &str = "/usr/share/nodewatch/scripts";
const DEFAULT_LOG_PATH: &str = "/var/log/nodewatch";
const DEFAULT_OUTPUT_PATH: &str = "/var/lib/nodewatch/script-files";

pub struct ScriptsProbe;

impl ScriptsProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for ScriptsProbe {
    fn name(&self) -> &'static str {
        "scripts"
    }

    fn on_tick(&mut self, host: &mut HostServices<'_>) -> Result<()> {
        let scripts_path = host.get_config_or("scripts-path", DEFAULT_SCRIPTS_PATH);
        let starter = host.get_config_or("script-starter", "/bin/sh");
        let log_path = PathBuf::from(host.get_config_or("scripts-log-path", DEFAULT_LOG_PATH));

        // scripts keep their own state (last-run markers and the like)
        // under a directory we hand them through the environment
        let output_path = host.get_config_or("scripts-output", DEFAULT_OUTPUT_PATH);
        std::env::set_var("NW_SCRIPTS_OUTPUT", &output_path);

        let Ok(entries) = std::fs::read_dir(&scripts_path) else {
            debug!(path = %scripts_path, "no scripts directory");
            return Ok(());
        };
        let mut scripts: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                // the folder ships a README placeholder; skip any such file
                !path
                    .file_name()
                    .map(|name| name.to_string_lossy().contains("README"))
                    .unwrap_or(false)
            })
            .collect();
        scripts.sort();

        let e = NodePath::root().key("scripts");
        for script in scripts {
            self.run_script(host, &e, &starter, &script, &log_path)?;
        }

        Ok(())
    }
}

impl ScriptsProbe {
    fn run_script(
        &self,
        host: &mut HostServices<'_>,
        e: &NodePath,
        starter: &str,
        script: &Path,
        log_path: &Path,
    ) -> Result<()> {
        let start_date = crate::epoch_now();

        let output = match Command::new(starter).arg(script).output() {
            Ok(output) => output,
            Err(err) => {
                warn!(script = %script.display(), "could not start script: {err}");
                host.append_error(
                    e,
                    "scripts",
                    &format!("could not start script \"{}\": {err}", script.display()),
                    65,
                )?;
                return Ok(());
            }
        };
        let exit_code = output.status.code().unwrap_or(-1);

        let entry = host.doc().push(&e.key("script"));
        host.doc()
            .set(&entry.key("name"), script.to_string_lossy().as_ref());
        host.doc().set(&entry.key("exit_code"), exit_code);

        debug!(script = %script.display(), exit_code, "script finished");

        let stdout = String::from_utf8_lossy(&output.stdout);
        if exit_code != 0 && !stdout.is_empty() {
            let mut text = self.generate_header(host, "OUTPUT", script, start_date);
            text.push_str(&stdout);
            if !text.ends_with('\n') {
                text.push('\n');
            }
            host.doc().set(&entry.key("output"), stdout.as_ref());
            append_log(&log_path.join("nodewatch-scripts.log"), &text);
            host.append_error(&entry, "scripts", &text, 65)?;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            let mut text = self.generate_header(host, "ERROR", script, start_date);
            text.push_str(&stderr);
            if !text.ends_with('\n') {
                text.push('\n');
            }
            append_log(&log_path.join("nodewatch-scripts-errors.log"), &text);
            host.append_error(&entry, "scripts", &text, 90)?;
        }

        Ok(())
    }

    /// Header written ahead of each captured block, mail-style so the
    /// concatenated log files stay readable.
    fn generate_header(
        &self,
        host: &HostServices<'_>,
        kind: &str,
        script: &Path,
        start_date: i64,
    ) -> String {
        format!(
            "--- {kind} -----------------------------------------------------------\n\
             Nodewatch-Version: {VERSION}\n\
             Output-Type: {kind}\n\
             Date: {}\n\
             Script: {}\n\
             Hostname: {}\n\
             \n",
            format_date(start_date),
            script.display(),
            host.state().hostname,
        )
    }
}

fn format_date(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%m/%d/%y %H:%M:%S").to_string(),
        _ => epoch.to_string(),
    }
}

fn append_log(path: &Path, text: &str) {
    use std::io::Write as _;
    let open = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path);
    match open {
        Ok(mut file) => {
            if let Err(e) = file.write_all(text.as_bytes()) {
                warn!(path = %path.display(), "could not append to script log: {e}");
            }
        }
        Err(e) => warn!(path = %path.display(), "could not open script log: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DaemonState;
    use nw_common::{Document, Value};
    use nw_config::ConfigProvider;

    fn run_probe(scripts_dir: &Path, logs_dir: &Path) -> Document {
        let config = ConfigProvider::new();
        config.set("scripts-path", scripts_dir.to_str().unwrap());
        config.set("scripts-log-path", logs_dir.to_str().unwrap());
        config.set("cache-path", "");
        let state = DaemonState::new(0);
        let mut doc = Document::new();
        {
            let mut host = HostServices::new(&mut doc, &config, &state);
            ScriptsProbe::new().on_tick(&mut host).unwrap();
        }
        doc
    }

    #[test]
    fn test_clean_script_no_errors() {
        let scripts = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        std::fs::write(scripts.path().join("check_ok"), "exit 0\n").unwrap();
        std::fs::write(scripts.path().join("nodewatch_README.md"), "docs\n").unwrap();

        let doc = run_probe(scripts.path(), logs.path());
        assert_eq!(doc.error_count(), 0);

        let entry = doc
            .get(&NodePath::root().key("scripts").key("script").at(0))
            .unwrap();
        assert_eq!(entry.get_key("exit_code").and_then(Value::as_i64), Some(0));
        // the README was skipped
        assert_eq!(
            doc.get(&NodePath::root().key("scripts").key("script"))
                .map(|v| v.len()),
            Some(1)
        );
    }

    #[test]
    fn test_failing_script_reports_output() {
        let scripts = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        std::fs::write(
            scripts.path().join("check_disk_array"),
            "echo 'raid degraded'\nexit 2\n",
        )
        .unwrap();

        let doc = run_probe(scripts.path(), logs.path());
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 65);

        let log = std::fs::read_to_string(logs.path().join("nodewatch-scripts.log")).unwrap();
        assert!(log.contains("--- OUTPUT ---"));
        assert!(log.contains("raid degraded"));
        assert!(log.contains("Nodewatch-Version:"));
    }

    #[test]
    fn test_stderr_is_a_broken_script() {
        let scripts = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        std::fs::write(
            scripts.path().join("buggy"),
            "echo 'oops' >&2\nexit 0\n",
        )
        .unwrap();

        let doc = run_probe(scripts.path(), logs.path());
        assert_eq!(doc.error_count(), 1);
        assert_eq!(doc.max_error_priority(), 90);

        let log =
            std::fs::read_to_string(logs.path().join("nodewatch-scripts-errors.log")).unwrap();
        assert!(log.contains("--- ERROR ---"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn test_nonzero_exit_without_output_is_quiet() {
        let scripts = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        std::fs::write(scripts.path().join("silent_fail"), "exit 3\n").unwrap();

        let doc = run_probe(scripts.path(), logs.path());
        assert_eq!(doc.error_count(), 0);
        let entry = doc
            .get(&NodePath::root().key("scripts").key("script").at(0))
            .unwrap();
        assert_eq!(entry.get_key("exit_code").and_then(Value::as_i64), Some(3));
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "01/01/70 00:00:00");
    }
}
