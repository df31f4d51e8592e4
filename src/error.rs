//! Error handling for the proc-detach crate.
//!
//! Two kinds of failure live here:
//!
//! * [`ErrorCode`] is the startup taxonomy. The lifecycle controller records
//!   exactly one of these per run, and its numeric value doubles as the
//!   process exit status, which is how a detached worker reports back to its
//!   launcher.
//! * [`Error`] covers faults of the library itself (bad configuration, option
//!   parsing, signal registration, I/O). Inside the lifecycle these are
//!   translated into the nearest [`ErrorCode`]; they only escape
//!   [`Daemon::run`](crate::Daemon::run) when no taxonomy member applies.
//!
//! # Capturing Source Errors
//!
//! ```no_run
//! use proc_detach::{Error, Result};
//! use std::fs::File;
//!
//! fn open_lock(path: &str) -> Result<File> {
//!     File::open(path).map_err(|err| {
//!         Error::io_with_source(format!("Failed to open lock file: {path}"), err)
//!     })
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Result type alias for proc-detach operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Startup outcome taxonomy.
///
/// The discriminant is the exit status a worker process uses to report the
/// outcome to its launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// Daemon started successfully
    #[default]
    Success = 0,
    /// Failed to change process credentials
    PersonalisationFailed = 10,
    /// Another copy of the process already holds the lock file
    AlreadyRunning = 11,
    /// Unknown failure during daemon initialisation
    InitFailed = 12,
    /// Failed to change the working directory
    ChdirFailed = 13,
    /// Failed to duplicate the process or to inspect the worker
    ForkFailed = 14,
    /// Starting a new session failed
    SidFailed = 15,
    /// Failed to create or lock the lock file
    CreateLockFailed = 16,
    /// The application's own start routine reported an error
    InitialiseFailed = 100,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), self.exit_code())
    }
}

impl ErrorCode {
    /// Every member of the taxonomy, in numeric order.
    pub const ALL: [Self; 9] = [
        Self::Success,
        Self::PersonalisationFailed,
        Self::AlreadyRunning,
        Self::InitFailed,
        Self::ChdirFailed,
        Self::ForkFailed,
        Self::SidFailed,
        Self::CreateLockFailed,
        Self::InitialiseFailed,
    ];

    /// Stable operator-facing name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::PersonalisationFailed => "PERSONALISATION_FAILED",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::InitFailed => "INIT_FAILED",
            Self::ChdirFailed => "CHDIR_FAILED",
            Self::ForkFailed => "FORK_FAILED",
            Self::SidFailed => "SID_FAILED",
            Self::CreateLockFailed => "CREATE_LOCK_FAILED",
            Self::InitialiseFailed => "INITIALISE_FAILED",
        }
    }

    /// Numeric value, used as the process exit status.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        self as u8
    }

    /// Decode a process exit status. Returns `None` for values outside the taxonomy.
    #[must_use]
    pub fn from_exit_status(status: i32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|code| i32::from(code.exit_code()) == status)
    }

    /// Whether this code reports a successful start.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Error type for library faults.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Command line, environment or options-file parsing errors
    #[error("Options error: {message}")]
    Options {
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Signal registration and delivery errors
    #[error("Signal handling error: {message}{}", .signal.map(|s| format!(" (signal {s})")).unwrap_or_default())]
    Signal {
        /// Human-readable error message
        message: String,
        /// Signal number if applicable
        signal: Option<i32>,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// I/O operation errors
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Errors reported by the embedding application
    #[error("Application error: {message}")]
    Application {
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new options error.
    pub fn options<S: Into<String>>(message: S) -> Self {
        Self::Options {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new options error with source error.
    pub fn options_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Options {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new signal error.
    pub fn signal<S: Into<String>>(message: S) -> Self {
        Self::Signal {
            message: message.into(),
            signal: None,
            source: None,
        }
    }

    /// Create a new signal error for a specific signal number.
    pub fn signal_with_number<S: Into<String>>(message: S, signal: i32) -> Self {
        Self::Signal {
            message: message.into(),
            signal: Some(signal),
            source: None,
        }
    }

    /// Create a new signal error for a specific signal number with source error.
    pub fn signal_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        signal: i32,
        source: E,
    ) -> Self {
        Self::Signal {
            message: message.into(),
            signal: Some(signal),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new I/O error with source error.
    pub fn io_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new application error.
    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::Application {
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is configuration-related.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Get the error category for logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Options { .. } => "options",
            Self::Signal { .. } => "signal",
            Self::Io { .. } => "io",
            Self::Timeout { .. } => "timeout",
            Self::Application { .. } => "application",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source("I/O operation failed", err)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Self::io_with_source(format!("System call failed: {}", err.desc()), err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::config(format!("Configuration loading failed: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::options_with_source("Options file is not valid TOML", err)
    }
}

impl From<clap::Error> for Error {
    fn from(err: clap::Error) -> Self {
        Self::options(format!("Command line parsing failed: {}", err.render()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_names_are_stable() {
        assert_eq!(ErrorCode::Success.as_str(), "SUCCESS");
        assert_eq!(ErrorCode::AlreadyRunning.as_str(), "ALREADY_RUNNING");
        assert_eq!(ErrorCode::InitialiseFailed.as_str(), "INITIALISE_FAILED");
        assert_eq!(ErrorCode::InitFailed.to_string(), "INIT_FAILED(12)");
    }

    #[test]
    fn test_exit_status_decoding() {
        assert_eq!(ErrorCode::from_exit_status(0), Some(ErrorCode::Success));
        assert_eq!(
            ErrorCode::from_exit_status(16),
            Some(ErrorCode::CreateLockFailed)
        );
        assert_eq!(
            ErrorCode::from_exit_status(100),
            Some(ErrorCode::InitialiseFailed)
        );
        assert_eq!(ErrorCode::from_exit_status(1), None);
        assert_eq!(ErrorCode::from_exit_status(-1), None);

        for code in ErrorCode::ALL {
            assert_eq!(
                ErrorCode::from_exit_status(i32::from(code.exit_code())),
                Some(code)
            );
        }
    }

    #[test]
    fn test_error_creation() {
        let err = Error::config("test message");
        assert!(err.is_config_error());
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_every_variant_has_a_category() {
        let errors = [
            Error::config("c"),
            Error::options("o"),
            Error::signal_with_number("s", 15),
            Error::io("i"),
            Error::timeout("t", 1),
            Error::application("a"),
        ];
        let categories: Vec<_> = errors.iter().map(Error::category).collect();
        assert_eq!(
            categories,
            ["config", "options", "signal", "io", "timeout", "application"]
        );
        assert_eq!(
            errors[2].to_string(),
            "Signal handling error: s (signal 15)"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = Error::timeout("wait for signal", 5000);
        assert!(err.is_timeout());
        assert_eq!(err.category(), "timeout");
        assert_eq!(
            err.to_string(),
            "Operation timed out after 5000ms: wait for signal"
        );
    }

    #[test]
    fn test_signal_error_display() {
        let err = Error::signal_with_number("Failed to block signal", 15);
        assert_eq!(
            err.to_string(),
            "Signal handling error: Failed to block signal (signal 15)"
        );
        assert_eq!(
            Error::signal("no handlers").to_string(),
            "Signal handling error: no handlers"
        );
    }

    #[test]
    fn test_errno_conversion() {
        let err = Error::from(nix::errno::Errno::ENOENT);
        assert_eq!(err.category(), "io");
    }
}
