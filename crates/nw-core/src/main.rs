//! nodewatch - host health-monitoring daemon.
//!
//! Wires the pieces together: configuration (file plus CLI overrides),
//! logging, the bus endpoint, the email transport, and the lifecycle
//! controller. The process exit code tells the service manager what to
//! do next: 0 done, 2 restart requested, anything else is a failure.

use clap::Parser;
use nw_config::ConfigProvider;
use nw_core::bus::{BusEvent, ChannelBus};
use nw_core::email::SendmailTransport;
use nw_core::logging::{init_logging, LogConfig};
use nw_core::server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// Host health-monitoring daemon
#[derive(Parser, Debug)]
#[command(name = "nodewatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the key=value configuration file
    #[arg(long, env = "NODEWATCH_CONFIG", default_value = "/etc/nodewatch/nodewatch.conf")]
    config: PathBuf,

    /// Email address of the administrator receiving reports
    #[arg(long, env = "NODEWATCH_ADMINISTRATOR_EMAIL")]
    administrator_email: Option<String>,

    /// Address used in the From field of report emails
    #[arg(long, env = "NODEWATCH_FROM_EMAIL")]
    from_email: Option<String>,

    /// Directory for run snapshots and rusage records
    #[arg(long, env = "NODEWATCH_DATA_PATH")]
    data_path: Option<String>,

    /// Directory for small cache files (last report time, probe memos)
    #[arg(long, env = "NODEWATCH_CACHE_PATH")]
    cache_path: Option<String>,

    /// Comma-separated probe list; * or empty runs every builtin probe
    #[arg(long)]
    plugins: Option<String>,

    /// Seconds between probe runs (minimum 60)
    #[arg(long)]
    statistics_frequency: Option<u64>,

    /// Retention window for run snapshots in seconds (minimum 3600)
    #[arg(long)]
    statistics_period: Option<u64>,

    /// TTL for persisted statistics: off, use-period, or seconds
    #[arg(long)]
    statistics_ttl: Option<String>,

    /// Seconds after startup before any report may fire (minimum 60)
    #[arg(long)]
    error_report_settle_time: Option<u64>,

    /// Low report tier as "priority[,span-seconds]"
    #[arg(long)]
    error_report_low_priority: Option<String>,

    /// Medium report tier as "priority[,span-seconds]"
    #[arg(long)]
    error_report_medium_priority: Option<String>,

    /// Critical report tier as "priority[,span-seconds]"
    #[arg(long)]
    error_report_critical_priority: Option<String>,

    /// Colon-separated regexes of mount points ignored by the disk probe
    #[arg(long)]
    disk_ignore: Option<String>,

    /// Run without a cluster bus: start ticking immediately
    #[arg(long, env = "NODEWATCH_STANDALONE")]
    standalone: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Omit timestamps from log output (journald adds its own)
    #[arg(long)]
    no_timestamps: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_verbosity(cli.verbose, cli.quiet);
    log_config.timestamps = !cli.no_timestamps;
    init_logging(&log_config);

    let config = match load_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("cannot load configuration: {e}");
            std::process::exit(1);
        }
    };

    let bus = ChannelBus::new();
    let handle = bus.handle();
    if cli.standalone {
        // no bus on this node: nobody will send READY, do it ourselves
        handle.send(BusEvent::Ready);
    }

    let mut server = Server::new(
        config,
        Box::new(bus),
        Box::new(SendmailTransport::default()),
    );
    let code = server.run();
    std::process::exit(code.as_i32());
}

fn load_config(cli: &Cli) -> nw_common::Result<ConfigProvider> {
    let config = if cli.config.is_file() {
        ConfigProvider::from_file(&cli.config)?
    } else {
        ConfigProvider::new()
    };

    // CLI and environment override the file
    if let Some(v) = &cli.administrator_email {
        config.set("administrator-email", v);
    }
    if let Some(v) = &cli.from_email {
        config.set("from-email", v);
    }
    if let Some(v) = &cli.data_path {
        config.set("data-path", v);
    }
    if let Some(v) = &cli.cache_path {
        config.set("cache-path", v);
    }
    if let Some(v) = &cli.plugins {
        config.set("plugins", v);
    }
    if let Some(v) = cli.statistics_frequency {
        config.set("statistics-frequency", &v.to_string());
    }
    if let Some(v) = cli.statistics_period {
        config.set("statistics-period", &v.to_string());
    }
    if let Some(v) = &cli.statistics_ttl {
        config.set("statistics-ttl", v);
    }
    if let Some(v) = cli.error_report_settle_time {
        config.set("error-report-settle-time", &v.to_string());
    }
    if let Some(v) = &cli.error_report_low_priority {
        config.set("error-report-low-priority", v);
    }
    if let Some(v) = &cli.error_report_medium_priority {
        config.set("error-report-medium-priority", v);
    }
    if let Some(v) = &cli.error_report_critical_priority {
        config.set("error-report-critical-priority", v);
    }
    if let Some(v) = &cli.disk_ignore {
        config.set("disk-ignore", v);
    }

    Ok(config)
}
