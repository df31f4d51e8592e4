//! Daemon lifecycle controller with builder pattern.
//!
//! [`Daemon::run`] takes a process from option parsing to termination:
//! singleness check, identity and directory changes, the optional detach
//! handshake, the signal policy, the instance lock, the application and the
//! wait for a shutdown signal.
//!
//! The detach handshake forks once. The launcher waits for the worker to
//! acknowledge with `SIGUSR1` (or die, raising `SIGCHLD`), then checks the
//! worker's status and the instance lock and exits with the result. The lock is
//! the ground truth; the signal only shortens the wait.

use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io::{self, IsTerminal, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, LogConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::lock::InstanceLock;
use crate::options::{self, Options};
use crate::personality;
use crate::signal::{
    signal_description, Discipline, FlagHandler, Request, SignalAction, SignalRegistry,
};

/// Signals that are dispatched and dropped.
pub const IGNORED_SIGNALS: [Signal; 7] = [
    Signal::SIGTSTP,
    Signal::SIGTTOU,
    Signal::SIGTTIN,
    Signal::SIGPIPE,
    Signal::SIGURG,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Signals that end the run phase.
pub const EXIT_SIGNALS: [Signal; 10] = [
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
];

/// Signal requesting a configuration reload.
pub const RELOAD_SIGNAL: Signal = Signal::SIGHUP;

/// Exit signal reported as [`Request::FastTerminate`] rather than
/// [`Request::GracefulExit`].
pub const QUIT_SIGNAL: Signal = Signal::SIGQUIT;

/// Application embedded in the daemon.
pub trait Application {
    /// Start the application. Called once the instance lock is held.
    ///
    /// # Errors
    ///
    /// A failure aborts the run with `INITIALISE_FAILED`.
    fn start(&mut self, options: &Options) -> Result<()>;

    /// Reload configuration. Called on `SIGHUP` when
    /// [`Config::hangup_reloads`] is set.
    fn restart(&mut self) {}

    /// Release resources. Called after the instance lock is released.
    fn terminate(&mut self) {}
}

/// Position of a daemon in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// `run` has not been called
    NotStarted,
    /// Options were read
    OptionsParsed,
    /// No other instance holds the lock
    SinglenessChecked,
    /// User, group and working directory were applied
    PrivilegeAndCwdSet,
    /// Forking into the background
    Detaching,
    /// Signal policy installed
    SignalsInstalled,
    /// Instance lock held
    Locked,
    /// Application started, waiting for signals
    Running,
    /// Releasing the lock and terminating the application
    ShuttingDown,
    /// Done
    Terminated,
}

/// Run time split into calendar units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Uptime {
    /// Whole days
    pub days: u64,
    /// Hours, 0..24
    pub hours: u64,
    /// Minutes, 0..60
    pub minutes: u64,
    /// Seconds, 0..60
    pub seconds: u64,
}

impl Uptime {
    /// Total in whole seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds
    }
}

impl From<Duration> for Uptime {
    fn from(elapsed: Duration) -> Self {
        let secs = elapsed.as_secs();
        Self {
            days: secs / 86_400,
            hours: secs % 86_400 / 3_600,
            minutes: secs % 3_600 / 60,
            seconds: secs % 60,
        }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d {}h {}m {}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Signal that ended the run phase
    pub signal: Signal,
    /// `FastTerminate` for [`QUIT_SIGNAL`], `GracefulExit` otherwise
    pub request: Request,
    /// Time spent running
    pub uptime: Uptime,
}

/// Result of [`Daemon::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Help, version or option info was printed
    Informational,
    /// This process is the launcher and the worker started
    Detached {
        /// Worker process id
        worker: Pid,
    },
    /// The application ran and was shut down by a signal
    Completed(ShutdownReport),
    /// Startup failed
    Aborted(ErrorCode),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Informational => f.write_str("informational output printed"),
            Self::Detached { worker } => write!(f, "detached into worker {worker}"),
            Self::Completed(report) => write!(
                f,
                "stopped by {} after {}",
                report.signal.as_str(),
                report.uptime
            ),
            Self::Aborted(code) => write!(f, "aborted with {code}"),
        }
    }
}

enum Detach {
    Launcher(RunOutcome),
    Worker,
}

/// Daemon lifecycle controller.
pub struct Daemon<A> {
    config: Config,
    app: A,
    options: Options,
    lock: InstanceLock,
    signals: SignalRegistry,
    launcher_pid: Pid,
    last_error: ErrorCode,
    state: LifecycleState,
    exit_request: Arc<FlagHandler>,
    quit_request: Arc<FlagHandler>,
    reload_request: Arc<FlagHandler>,
}

impl<A: Application> Daemon<A> {
    /// Create a new daemon builder.
    #[must_use]
    pub fn builder(config: Config, app: A) -> DaemonBuilder<A> {
        DaemonBuilder::new(config, app)
    }

    /// Run the daemon. `args` includes the program name first.
    ///
    /// Must be called before the process spawns threads: signal masks are
    /// per-thread and forking a multi-threaded process is unsound.
    ///
    /// Startup failures are reported as [`RunOutcome::Aborted`] and recorded
    /// in [`Daemon::last_error`].
    ///
    /// # Errors
    ///
    /// Returns an error for faults outside the startup taxonomy: invalid
    /// options, an unusable log file, or a failure to install the signal policy.
    pub fn run<I, T>(&mut self, args: I) -> Result<RunOutcome>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        init_logging(&self.config.logging)?;
        self.execute(args.into_iter().map(Into::into).collect())
    }

    #[instrument(skip_all, fields(daemon_name = %self.config.name))]
    fn execute(&mut self, args: Vec<String>) -> Result<RunOutcome> {
        let consumed = self.options.read_options(args)?;
        self.state = LifecycleState::OptionsParsed;
        debug!(consumed, arguments = ?self.options.arguments(), "Options parsed");

        if let Some(text) = self.informational_text() {
            print!("{text}");
            io::stdout()
                .flush()
                .map_err(|e| Error::io_with_source("Failed to write to stdout", e))?;
            return Ok(RunOutcome::Informational);
        }

        if self.lock.is_locked() {
            let holder = self.lock.read_pid().ok().flatten();
            error!(
                lock_file = %self.lock.path().display(),
                holder = ?holder,
                "Another instance is already running"
            );
            return Ok(self.abort(ErrorCode::AlreadyRunning));
        }
        self.state = LifecycleState::SinglenessChecked;

        let user = self.options.value(options::USER).unwrap_or_default();
        let group = self.options.value(options::GROUP).unwrap_or_default();
        if let Err(e) = personality::set_user_group(user, group) {
            error!(error = %e, user, group, "Failed to change process identity");
            return Ok(self.abort(ErrorCode::PersonalisationFailed));
        }
        if let Some(dir) = &self.config.working_dir {
            if let Err(e) = personality::change_dir(dir) {
                error!(error = %e, "Failed to change working directory");
                return Ok(self.abort(ErrorCode::ChdirFailed));
            }
        }
        self.state = LifecycleState::PrivilegeAndCwdSet;

        if self.options.switch(options::DAEMON) {
            self.state = LifecycleState::Detaching;
            if let Detach::Launcher(outcome) = self.daemonize()? {
                return Ok(outcome);
            }
        }

        self.setup_signals()?;
        self.state = LifecycleState::SignalsInstalled;

        if let Err(e) = self.lock.lock() {
            error!(error = %e, "Failed to acquire instance lock");
            return Ok(self.abort(ErrorCode::CreateLockFailed));
        }
        self.state = LifecycleState::Locked;
        info!(pid = %Pid::this(), lock_file = %self.lock.path().display(), "Instance lock acquired");

        if self.is_worker() {
            if let Err(e) = kill(self.launcher_pid, Signal::SIGUSR1) {
                warn!(error = %e, launcher = %self.launcher_pid, "Failed to notify launcher");
            }
        }

        if let Err(e) = self.app.start(&self.options) {
            error!(error = %e, "Application failed to start");
            if let Err(e) = self.lock.unlock() {
                warn!(error = %e, "Failed to release instance lock");
            }
            return Ok(self.abort(ErrorCode::InitialiseFailed));
        }
        self.record(ErrorCode::Success);
        self.state = LifecycleState::Running;
        let started_at = Instant::now();
        info!("Daemon started successfully, waiting for shutdown signal");

        let (signal, request) = self.wait_for_shutdown()?;
        let uptime = Uptime::from(started_at.elapsed());

        self.shutdown();
        info!(signal = signal.as_str(), ?request, uptime = %uptime, "Daemon shutdown complete");
        Ok(RunOutcome::Completed(ShutdownReport {
            signal,
            request,
            uptime,
        }))
    }

    fn informational_text(&self) -> Option<String> {
        if self.options.switch(options::HELP) {
            let mut text = String::new();
            if !self.config.description.is_empty() {
                let _ = writeln!(text, "{}\n", self.config.description);
            }
            text.push_str(&self.options.render_help());
            Some(text)
        } else if self.options.switch(options::VERSION) {
            Some(format!(
                "{} Version: {} BuildTime: {}\n",
                self.config.name, self.config.version, self.config.build_time
            ))
        } else if self.options.switch(options::INFO) {
            let mut text = String::from("Options set:\n");
            for (name, value) in self.options.found() {
                let _ = writeln!(text, "  {name}: {value}");
            }
            Some(text)
        } else {
            None
        }
    }

    /// Fork into launcher and worker.
    #[allow(unsafe_code)]
    fn daemonize(&mut self) -> Result<Detach> {
        // Early notifications stay pending until the launcher waits
        for signal in [Signal::SIGUSR1, Signal::SIGCHLD] {
            self.signals
                .set_handler(signal, SignalAction::Ignore, Discipline::Synchronous)?;
        }

        // SAFETY: `run` must be called before the process spawns threads, so
        // the child is a complete copy of a single-threaded process.
        match unsafe { unistd::fork() } {
            Err(e) => {
                error!(error = %e, "Failed to fork worker");
                Ok(Detach::Launcher(self.abort(ErrorCode::ForkFailed)))
            }
            Ok(ForkResult::Parent { child }) => {
                self.lock.keep_file();
                self.await_worker(child).map(Detach::Launcher)
            }
            Ok(ForkResult::Child) => {
                // The worker has no children of its own to hear about
                self.signals.set_handler(
                    Signal::SIGCHLD,
                    SignalAction::Default,
                    Discipline::Asynchronous,
                )?;
                self.detach_worker();
                Ok(Detach::Worker)
            }
        }
    }

    fn await_worker(&mut self, worker: Pid) -> Result<RunOutcome> {
        let ack = FlagHandler::shared(Request::Acknowledge);
        for signal in [Signal::SIGUSR1, Signal::SIGCHLD] {
            self.signals.set_handler(
                signal,
                SignalAction::handler(Arc::clone(&ack)),
                Discipline::Synchronous,
            )?;
        }

        let timeout = self.config.init_timeout();
        info!(worker = %worker, timeout_secs = timeout.as_secs(), "Waiting for worker to initialise");
        match self.signals.wait_signal(Some(timeout)) {
            Ok(signal) => debug!(signal = signal_description(signal), "Worker reported"),
            Err(e) if e.is_timeout() => warn!("Worker did not report before the timeout"),
            Err(e) => return Err(e),
        }

        let status = waitpid(worker, Some(WaitPidFlag::WNOHANG));
        let code = assess_worker(status, self.lock.is_locked());
        self.record(code);

        if code.is_success() {
            info!(worker = %worker, "Worker is running");
            Ok(RunOutcome::Detached { worker })
        } else {
            error!(worker = %worker, code = %code, "Worker failed to initialise");
            Ok(RunOutcome::Aborted(code))
        }
    }

    fn detach_worker(&mut self) {
        // The inherited descriptor shares its lock with the launcher
        self.lock.release_descriptor();

        if let Err(e) = redirect_stdio() {
            warn!(error = %e, "Failed to redirect standard streams");
        }
        let _previous = umask(Mode::empty());

        match unistd::setsid() {
            Ok(session) => debug!(session = %session, "Worker detached"),
            Err(e) => {
                error!(error = %e, "Failed to create a new session");
                self.record(ErrorCode::SidFailed);
            }
        }
    }

    fn setup_signals(&self) -> Result<()> {
        for signal in IGNORED_SIGNALS {
            self.signals
                .set_handler(signal, SignalAction::Ignore, Discipline::Asynchronous)?;
        }

        // Synchronous, so the run phase observes them in `wait_signal`
        let exit = SignalAction::handler(Arc::clone(&self.exit_request));
        let quit = SignalAction::handler(Arc::clone(&self.quit_request));
        for signal in EXIT_SIGNALS {
            let action = if signal == QUIT_SIGNAL { &quit } else { &exit };
            self.signals
                .set_handler(signal, action.clone(), Discipline::Synchronous)?;
        }
        self.signals.set_handler(
            RELOAD_SIGNAL,
            SignalAction::handler(Arc::clone(&self.reload_request)),
            Discipline::Synchronous,
        )?;

        debug!("Signal policy installed");
        Ok(())
    }

    fn wait_for_shutdown(&mut self) -> Result<(Signal, Request)> {
        loop {
            let signal = self.signals.wait_signal(None)?;
            if self.reload_request.take() && self.config.hangup_reloads {
                self.reload();
                continue;
            }
            self.exit_request.take();
            let request = if self.quit_request.take() {
                Request::FastTerminate
            } else {
                Request::GracefulExit
            };
            info!(signal = signal_description(signal), ?request, "Shutdown requested");
            return Ok((signal, request));
        }
    }

    /// Ask the application to reload.
    pub fn reload(&mut self) {
        info!("Reload requested");
        self.app.restart();
    }

    /// Release the instance lock, then terminate the application.
    pub fn shutdown(&mut self) {
        self.state = LifecycleState::ShuttingDown;
        if let Err(e) = self.lock.unlock() {
            warn!(error = %e, "Failed to release instance lock");
        }
        self.app.terminate();
        self.state = LifecycleState::Terminated;
    }

    fn record(&mut self, code: ErrorCode) {
        if code.is_success() && !self.last_error.is_success() {
            return;
        }
        self.last_error = code;
    }

    fn abort(&mut self, code: ErrorCode) -> RunOutcome {
        self.record(code);
        RunOutcome::Aborted(code)
    }

    /// Last recorded error code.
    #[must_use]
    pub const fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Options read by the last run.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Embedded application.
    #[must_use]
    pub const fn app(&self) -> &A {
        &self.app
    }

    /// Embedded application, mutably.
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Signal registry owned by this daemon.
    #[must_use]
    pub const fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    /// Pid of the process that built the daemon.
    #[must_use]
    pub const fn launcher_pid(&self) -> Pid {
        self.launcher_pid
    }

    /// Whether this process is a detached worker.
    #[must_use]
    pub fn is_worker(&self) -> bool {
        Pid::this() != self.launcher_pid
    }
}

impl<A> fmt::Debug for Daemon<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("launcher_pid", &self.launcher_pid)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Classify the worker after the launcher's wait.
fn assess_worker(status: nix::Result<WaitStatus>, lock_held: bool) -> ErrorCode {
    match status {
        Ok(WaitStatus::Exited(_, status)) => match ErrorCode::from_exit_status(status) {
            // Exiting before acknowledging is a failure whatever it reports
            Some(ErrorCode::Success) | None => {
                warn!(status, "Worker exited during initialisation");
                ErrorCode::InitFailed
            }
            Some(code) => code,
        },
        Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
            warn!(
                signal = signal_description(signal),
                core_dumped, "Worker killed during initialisation"
            );
            ErrorCode::InitFailed
        }
        Ok(_) if lock_held => ErrorCode::Success,
        Ok(_) => ErrorCode::InitFailed,
        Err(e) => {
            error!(error = %e, "Failed to query worker status");
            ErrorCode::ForkFailed
        }
    }
}

fn redirect_stdio() -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| Error::io_with_source("Failed to open /dev/null", e))?;
    for fd in 0..=2 {
        unistd::dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}

/// Initialize the logging system based on configuration.
///
/// A subscriber installed earlier in the process is kept.
fn init_logging(config: &LogConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::io_with_source(
                        format!("Failed to open log file at {}", path.display()),
                        e,
                    )
                })?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    if config.json {
        #[cfg(feature = "json-logs")]
        {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(writer)
                .json()
                .flatten_event(true)
                .finish();
            install_subscriber(subscriber);
            return Ok(());
        }

        #[cfg(not(feature = "json-logs"))]
        {
            return Err(Error::config(
                "JSON logging requested but feature not enabled",
            ));
        }
    }

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.file.is_none() && io::stderr().is_terminal())
        .with_writer(writer)
        .compact()
        .finish();
    install_subscriber(subscriber);
    Ok(())
}

fn install_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        debug!("Logging initialized");
    }
}

/// Builder for creating daemon instances with fluent API.
pub struct DaemonBuilder<A> {
    config: Config,
    app: A,
    options: Options,
}

impl<A: Application> DaemonBuilder<A> {
    /// Create a new daemon builder with the provided configuration.
    #[must_use]
    pub fn new(config: Config, app: A) -> Self {
        let mut options = Options::with_builtins(config.name.clone());
        options.set_options_file(config.options_file.clone());
        options.set_env_prefix(Some(config.option_env_prefix()));
        Self {
            config,
            app,
            options,
        }
    }

    /// Declare an application switch.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed or already declared.
    pub fn with_switch_option(mut self, short: Option<char>, long: &str, description: &str) -> Result<Self> {
        self.options.add_switch_option(short, long, description)?;
        Ok(self)
    }

    /// Declare an application option taking a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed or already declared.
    pub fn with_value_option(mut self, short: Option<char>, long: &str, description: &str) -> Result<Self> {
        self.options.add_value_option(short, long, description)?;
        Ok(self)
    }

    /// Build the daemon. The calling process becomes the launcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Daemon<A>> {
        self.config.validate()?;
        let lock = InstanceLock::new(&self.config.lock_file);

        Ok(Daemon {
            lock,
            config: self.config,
            app: self.app,
            options: self.options,
            signals: SignalRegistry::new(),
            launcher_pid: Pid::this(),
            last_error: ErrorCode::Success,
            state: LifecycleState::NotStarted,
            exit_request: FlagHandler::shared(Request::GracefulExit),
            quit_request: FlagHandler::shared(Request::FastTerminate),
            reload_request: FlagHandler::shared(Request::Reload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        fail_start: bool,
        started: usize,
        terminated: usize,
    }

    impl Application for Recorder {
        fn start(&mut self, _options: &Options) -> Result<()> {
            self.started += 1;
            if self.fail_start {
                Err(Error::application("refusing to start"))
            } else {
                Ok(())
            }
        }

        fn terminate(&mut self) {
            self.terminated += 1;
        }
    }

    fn daemon_in(dir: &Path, app: Recorder) -> Daemon<Recorder> {
        let config = Config::builder()
            .name("unit-daemon")
            .lock_file(dir.join("unit.lock"))
            .env_prefix("UNIT_DAEMON_TEST_")
            .build()
            .unwrap();
        Daemon::builder(config, app).build().unwrap()
    }

    #[test]
    fn test_worker_exit_is_classified() {
        let pid = Pid::from_raw(4242);

        assert_eq!(
            assess_worker(Ok(WaitStatus::Exited(pid, 0)), true),
            ErrorCode::InitFailed
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::Exited(pid, 11)), false),
            ErrorCode::AlreadyRunning
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::Exited(pid, 100)), false),
            ErrorCode::InitialiseFailed
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::Exited(pid, 1)), false),
            ErrorCode::InitFailed
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)), true),
            ErrorCode::InitFailed
        );
    }

    #[test]
    fn test_live_worker_needs_the_lock() {
        let pid = Pid::from_raw(4242);

        assert_eq!(
            assess_worker(Ok(WaitStatus::StillAlive), true),
            ErrorCode::Success
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::StillAlive), false),
            ErrorCode::InitFailed
        );
        assert_eq!(
            assess_worker(Ok(WaitStatus::Stopped(pid, Signal::SIGSTOP)), true),
            ErrorCode::Success
        );
        assert_eq!(
            assess_worker(Err(Errno::ECHILD), true),
            ErrorCode::ForkFailed
        );
    }

    #[test]
    fn test_uptime_decomposition() {
        let uptime = Uptime::from(Duration::from_secs(90_061));
        assert_eq!(
            uptime,
            Uptime {
                days: 1,
                hours: 1,
                minutes: 1,
                seconds: 1
            }
        );
        assert_eq!(uptime.to_string(), "1d 1h 1m 1s");

        for secs in [0, 59, 60, 3_599, 3_600, 86_399, 86_400, 1_000_000] {
            let uptime = Uptime::from(Duration::from_millis(secs * 1_000 + 999));
            assert_eq!(uptime.as_secs(), secs);
            assert!(uptime.hours < 24 && uptime.minutes < 60 && uptime.seconds < 60);
        }
    }

    #[test]
    fn test_version_does_not_touch_lock() {
        let dir = tempdir().unwrap();
        let mut daemon = daemon_in(dir.path(), Recorder::default());

        let outcome = daemon.run(["unit-daemon", "--version"]).unwrap();
        assert_eq!(outcome, RunOutcome::Informational);
        assert_eq!(daemon.state(), LifecycleState::OptionsParsed);
        assert_eq!(daemon.last_error(), ErrorCode::Success);
        assert!(!dir.path().join("unit.lock").exists());
        assert_eq!(daemon.app().started, 0);
    }

    #[test]
    fn test_info_lists_found_options() {
        let dir = tempdir().unwrap();
        let mut daemon = daemon_in(dir.path(), Recorder::default());

        let outcome = daemon.run(["unit-daemon", "-i", "-u", "nobody"]).unwrap();
        assert_eq!(outcome, RunOutcome::Informational);

        let text = daemon.informational_text().unwrap();
        assert!(text.starts_with("Options set:"));
        assert!(text.contains("user: nobody"));
    }

    #[test]
    fn test_already_running() {
        let dir = tempdir().unwrap();
        let mut holder = InstanceLock::new(dir.path().join("unit.lock"));
        holder.lock().unwrap();

        let mut daemon = daemon_in(dir.path(), Recorder::default());
        let outcome = daemon.run(["unit-daemon"]).unwrap();

        assert_eq!(outcome, RunOutcome::Aborted(ErrorCode::AlreadyRunning));
        assert_eq!(daemon.last_error(), ErrorCode::AlreadyRunning);
        assert_eq!(daemon.state(), LifecycleState::OptionsParsed);
        drop(daemon);
        assert_eq!(holder.read_pid().unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_unknown_user_aborts() {
        let dir = tempdir().unwrap();
        let mut daemon = daemon_in(dir.path(), Recorder::default());

        let outcome = daemon
            .run(["unit-daemon", "--user", "no-such-user-for-detach-tests"])
            .unwrap();
        assert_eq!(outcome, RunOutcome::Aborted(ErrorCode::PersonalisationFailed));
        assert_eq!(daemon.state(), LifecycleState::SinglenessChecked);
    }

    #[test]
    fn test_missing_working_dir_aborts() {
        let dir = tempdir().unwrap();
        let config = Config::builder()
            .name("unit-daemon")
            .lock_file(dir.path().join("unit.lock"))
            .working_dir(dir.path().join("missing"))
            .build()
            .unwrap();
        let mut daemon = Daemon::builder(config, Recorder::default()).build().unwrap();

        let outcome = daemon.run(["unit-daemon"]).unwrap();
        assert_eq!(outcome, RunOutcome::Aborted(ErrorCode::ChdirFailed));
        drop(daemon);
        assert!(!dir.path().join("unit.lock").exists());
    }

    #[test]
    fn test_start_failure_releases_lock() {
        let dir = tempdir().unwrap();
        let app = Recorder {
            fail_start: true,
            ..Recorder::default()
        };
        let mut daemon = daemon_in(dir.path(), app);

        let outcome = daemon.run(["unit-daemon"]).unwrap();
        assert_eq!(outcome, RunOutcome::Aborted(ErrorCode::InitialiseFailed));
        assert_eq!(daemon.state(), LifecycleState::Locked);
        assert_eq!(daemon.app().started, 1);
        assert_eq!(daemon.app().terminated, 0);
        assert!(!daemon.is_worker());

        let mut observer = InstanceLock::new(dir.path().join("unit.lock"));
        assert!(!observer.is_locked());
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        let dir = tempdir().unwrap();
        let mut daemon = daemon_in(dir.path(), Recorder::default());

        let err = daemon.run(["unit-daemon", "--bogus"]).unwrap_err();
        assert_eq!(err.category(), "options");
        assert_eq!(daemon.state(), LifecycleState::NotStarted);
    }

    #[test]
    fn test_failure_is_not_overwritten_by_success() {
        let dir = tempdir().unwrap();
        let mut daemon = daemon_in(dir.path(), Recorder::default());

        daemon.record(ErrorCode::SidFailed);
        daemon.record(ErrorCode::Success);
        assert_eq!(daemon.last_error(), ErrorCode::SidFailed);

        daemon.record(ErrorCode::CreateLockFailed);
        assert_eq!(daemon.last_error(), ErrorCode::CreateLockFailed);
    }

    #[test]
    fn test_duplicate_application_option_is_rejected() {
        let dir = tempdir().unwrap();
        let config = Config::builder()
            .lock_file(dir.path().join("unit.lock"))
            .build()
            .unwrap();

        assert!(Daemon::builder(config.clone(), Recorder::default())
            .with_switch_option(Some('d'), "detach", "clashes with --daemon")
            .is_err());
        assert!(Daemon::builder(config, Recorder::default())
            .with_value_option(Some('s'), "state-dir", "state directory")
            .and_then(DaemonBuilder::build)
            .is_ok());
    }

    #[test]
    fn test_logging_init_is_repeatable() {
        let config = LogConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            RunOutcome::Aborted(ErrorCode::AlreadyRunning).to_string(),
            "aborted with ALREADY_RUNNING(11)"
        );
        let report = ShutdownReport {
            signal: Signal::SIGTERM,
            request: Request::GracefulExit,
            uptime: Uptime::from(Duration::from_secs(61)),
        };
        assert_eq!(
            RunOutcome::Completed(report).to_string(),
            "stopped by SIGTERM after 0d 0h 1m 1s"
        );
    }
}
