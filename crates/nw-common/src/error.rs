//! Error types for NodeWatch.
//!
//! All NodeWatch crates report failures through this taxonomy. Error codes
//! are stable so operators can match on them from scripts and log scrapers.

use thiserror::Error;

/// Result type alias for NodeWatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration and definition-file errors.
    Config,
    /// Probe registry errors (unknown probes, dependency cycles).
    Registry,
    /// Failures inside a probe's tick.
    Probe,
    /// File I/O and serialization errors.
    Io,
    /// Bus message errors.
    Bus,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Registry => write!(f, "registry"),
            ErrorCategory::Probe => write!(f, "probe"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Bus => write!(f, "bus"),
        }
    }
}

/// Unified error type for NodeWatch.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing required field: {0}")]
    MissingField(String),

    // Registry errors (20-29)
    #[error("unknown probe: {0}")]
    UnknownProbe(String),

    #[error("duplicate probe name: {0}")]
    DuplicateProbe(String),

    #[error("probe dependency cycle involving {0}")]
    Cycle(String),

    // Probe errors (30-39)
    #[error("probe {probe} failed: {message}")]
    ProbeFailure { probe: String, message: String },

    #[error("priority must be between 0 and 100 inclusive, {0} is not valid")]
    InvalidPriority(i32),

    // I/O errors (40-49)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Bus errors (50-59)
    #[error("malformed bus message {command}: missing {field}")]
    MessageMalformed { command: String, field: String },
}

impl Error {
    /// Returns the stable error code for this error.
    ///
    /// Codes are grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Registry errors
    /// - 30-39: Probe errors
    /// - 40-49: I/O errors
    /// - 50-59: Bus errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidValue { .. } => 11,
            Error::MissingField(_) => 12,
            Error::UnknownProbe(_) => 20,
            Error::DuplicateProbe(_) => 21,
            Error::Cycle(_) => 22,
            Error::ProbeFailure { .. } => 30,
            Error::InvalidPriority(_) => 31,
            Error::Io(_) => 40,
            Error::Json(_) => 41,
            Error::MessageMalformed { .. } => 50,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidValue { .. } | Error::MissingField(_) => {
                ErrorCategory::Config
            }
            Error::UnknownProbe(_) | Error::DuplicateProbe(_) | Error::Cycle(_) => {
                ErrorCategory::Registry
            }
            Error::ProbeFailure { .. } | Error::InvalidPriority(_) => ErrorCategory::Probe,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
            Error::MessageMalformed { .. } => ErrorCategory::Bus,
        }
    }

    /// Returns whether this error is potentially recoverable.
    ///
    /// Recoverable errors leave the daemon running: configuration problems
    /// fall back to clamped defaults, probe failures become document
    /// errors, I/O failures skip one persistence cycle. Registry errors
    /// are fatal at startup.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::InvalidValue { .. } => true,
            Error::MissingField(_) => true,

            // Registry errors block loading and are fatal at startup.
            Error::UnknownProbe(_) => false,
            Error::DuplicateProbe(_) => false,
            Error::Cycle(_) => false,

            Error::ProbeFailure { .. } => true,
            // Programmer error surfaced to the probe, not the daemon.
            Error::InvalidPriority(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => true,

            // Logged and dropped.
            Error::MessageMalformed { .. } => true,
        }
    }
}
