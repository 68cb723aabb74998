//! Logging bootstrap for the nodewatch daemon.
//!
//! All log output goes to stderr; stdout stays clean for tooling that
//! wraps the daemon. `NODEWATCH_LOG` (or the standard `RUST_LOG`) selects
//! the filter, defaulting to `info` for our crates.

use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Logging configuration resolved from the CLI and environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no environment filter is set ("trace".."error").
    pub level: String,
    /// Include timestamps in the output.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Map `-v` repetition onto a level.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = if quiet {
            "error"
        } else {
            match verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        };
        Self {
            level: level.to_string(),
            ..Self::default()
        }
    }
}

/// Initialize the logging subsystem. Must be called once at startup.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_env("NODEWATCH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "nw_core={level},nw_config={level},nw_common={level}",
                level = config.level
            ))
        });

    let use_ansi = std::io::stderr().is_terminal();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(use_ansi);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    // a second init (tests) is harmless
    if let Err(e) = result {
        tracing::debug!("logging already initialized: {e}");
    }
}
