#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//! # proc-detach: Unix Daemonization Framework
//!
//! Turns a command line program into a well-behaved Unix daemon.
//!
//! ## Key Features
//!
//! - **Detach Handshake**: fork once; the launcher exits only after the worker
//!   holds the instance lock and reports readiness, or with the worker's error
//! - **Single Instance**: advisory lock file that records the holder's pid
//! - **Deterministic Signals**: signals are either blocked and collected
//!   synchronously or dispatched immediately, never both
//! - **Runtime Options**: switches and value options from the command line,
//!   the environment and an options file
//! - **Stable Exit Codes**: every startup failure maps to a documented code
//! - **Structured Logging**: tracing with optional JSON and log file output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proc_detach::{Application, Config, Daemon, Options, Result};
//!
//! struct Service;
//!
//! impl Application for Service {
//!     fn start(&mut self, options: &Options) -> Result<()> {
//!         tracing::info!(arguments = ?options.arguments(), "Service started");
//!         Ok(())
//!     }
//!
//!     fn terminate(&mut self) {
//!         tracing::info!("Service stopped");
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = Config::builder().name("service").build()?;
//!     let mut daemon = Daemon::builder(config, Service).build()?;
//!
//!     // `--daemon` detaches; the launcher returns once the worker is up
//!     let outcome = daemon.run(std::env::args())?;
//!     println!("{outcome}");
//!     std::process::exit(i32::from(daemon.last_error().exit_code()));
//! }
//! ```

// Private modules
mod config;
mod daemon;
mod error;

// Public modules
pub mod lock;
pub mod options;
pub mod personality;
pub mod signal;

// Public exports
pub use config::{Config, ConfigBuilder, LogConfig, LogLevel, CONFIG_ENV_PREFIX};
pub use daemon::{
    Application, Daemon, DaemonBuilder, LifecycleState, RunOutcome, ShutdownReport, Uptime,
    EXIT_SIGNALS, IGNORED_SIGNALS, QUIT_SIGNAL, RELOAD_SIGNAL,
};
pub use error::{Error, ErrorCode, Result};
pub use lock::InstanceLock;
pub use options::Options;
pub use signal::{Discipline, FlagHandler, Request, Signal, SignalAction, SignalHandler, SignalRegistry};

/// Version of the proc-detach library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default time the launcher waits for the worker, in seconds
pub const MAX_INIT_TIMEOUT_SECS: u64 = 10;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "detach.toml";
