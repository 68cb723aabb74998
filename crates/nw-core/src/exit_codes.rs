//! Exit codes for the nodewatch daemon.
//!
//! These are a stable contract for the service manager: the unit file
//! restarts the daemon on exit code 2 (restart requested after a
//! configuration reload) and treats any other nonzero code as a failure.

/// Exit codes for nodewatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean stop (STOP message, QUITTING, or SIGINT).
    Clean = 0,

    /// Fatal startup or runtime error.
    Fatal = 1,

    /// A restart was requested (RELOADCONFIG); the service manager is
    /// expected to start a fresh process.
    RestartRequested = 2,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Check if this exit code indicates an error requiring attention.
    pub fn is_error(self) -> bool {
        matches!(self, ExitCode::Fatal)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Fatal => "ERR_FATAL",
            ExitCode::RestartRequested => "OK_RESTART",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_values() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::Fatal.as_i32(), 1);
        assert_eq!(ExitCode::RestartRequested.as_i32(), 2);
    }

    #[test]
    fn test_is_error() {
        assert!(!ExitCode::Clean.is_error());
        assert!(!ExitCode::RestartRequested.is_error());
        assert!(ExitCode::Fatal.is_error());
    }
}
