//! Signal channel with synchronous and asynchronous delivery disciplines.
//!
//! A [`SignalRegistry`] keeps two tables mapping signals to [`SignalAction`]s:
//!
//! * **Synchronous** signals are blocked from OS delivery and are only observed
//!   by [`SignalRegistry::wait_signal`], which invokes the matching handler on
//!   the waiting thread.
//! * **Asynchronous** signals are routed to a fixed dispatch routine that
//!   invokes the handler immediately, in signal context.
//!
//! The synchronous table belongs to the registry and the thread that waits on
//! it. The asynchronous table is process-wide, like the OS dispositions it
//! mirrors: every registry reads and writes the same slots.
//!
//! A signal is active in at most one table: registering it under one
//! discipline resets its entry in the other to [`SignalAction::Ignore`].
//!
//! Signal masks are per-thread. A synchronous registration blocks the signal
//! for the calling thread and every thread it spawns afterwards, so register
//! before starting threads.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use nix::errno::Errno;
use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};

pub use nix::sys::signal::Signal;

/// Table size; covers every classic signal number on supported platforms.
const SIGNAL_SLOTS: usize = 65;

/// Asynchronous actions, read by the OS entry point. An empty slot is `Ignore`.
static DISPATCH: [ArcSwapOption<SignalAction>; SIGNAL_SLOTS] =
    [const { ArcSwapOption::const_empty() }; SIGNAL_SLOTS];

/// Actions replaced in [`DISPATCH`]. Never freed, so a dispatch racing with a
/// replacement cannot drop the last reference in signal context.
static RETIRED: Mutex<Vec<Arc<SignalAction>>> = parking_lot::const_mutex(Vec::new());

/// Capability to react to a delivered signal.
///
/// Asynchronous handlers run in signal context: they must not block, allocate
/// or take locks. Setting an atomic flag is the intended pattern.
pub trait SignalHandler: Send + Sync {
    /// Handle `signal`, returning a status code.
    fn handle_signal(&self, signal: Signal) -> i32;
}

/// What happens when a registered signal is delivered.
#[derive(Clone, Default)]
pub enum SignalAction {
    /// Drop the signal
    #[default]
    Ignore,
    /// Leave the signal to the default OS action. As an asynchronous
    /// registration this restores the default disposition and unblocks the
    /// signal.
    Default,
    /// Marker for a failed registration
    Error,
    /// Invoke a handler
    Handler(Arc<dyn SignalHandler>),
}

impl SignalAction {
    /// Wrap a shared handler.
    pub fn handler<H: SignalHandler + 'static>(handler: Arc<H>) -> Self {
        Self::Handler(handler)
    }

    /// Whether this action invokes a handler.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    fn invoke(&self, signal: Signal) -> Option<i32> {
        match self {
            Self::Handler(handler) => Some(handler.handle_signal(signal)),
            Self::Ignore | Self::Default | Self::Error => None,
        }
    }
}

impl PartialEq for SignalAction {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Handler(a), Self::Handler(b)) => Arc::ptr_eq(a, b),
            (Self::Ignore, Self::Ignore)
            | (Self::Default, Self::Default)
            | (Self::Error, Self::Error) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => f.write_str("Ignore"),
            Self::Default => f.write_str("Default"),
            Self::Error => f.write_str("Error"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Delivery discipline for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Blocked, collected by [`SignalRegistry::wait_signal`]
    Synchronous,
    /// Delivered immediately to the dispatch routine
    Asynchronous,
}

/// Request recorded by a [`FlagHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Reload configuration
    Reload,
    /// Terminate without lingering (`SIGQUIT`)
    FastTerminate,
    /// Shut down gracefully
    GracefulExit,
    /// A peer acknowledged something (e.g. worker initialisation)
    Acknowledge,
}

/// Edge-triggered handler that records that a signal arrived.
#[derive(Debug)]
pub struct FlagHandler {
    request: Request,
    raised: AtomicBool,
    last_signal: AtomicI32,
}

impl FlagHandler {
    /// Create a handler for `request`.
    #[must_use]
    pub const fn new(request: Request) -> Self {
        Self {
            request,
            raised: AtomicBool::new(false),
            last_signal: AtomicI32::new(0),
        }
    }

    /// Create a shared handler, ready to be registered.
    #[must_use]
    pub fn shared(request: Request) -> Arc<Self> {
        Arc::new(Self::new(request))
    }

    /// The request this handler stands for.
    #[must_use]
    pub const fn request(&self) -> Request {
        self.request
    }

    /// Test the flag without clearing it.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Test and clear the flag.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    /// Last signal that raised the flag.
    #[must_use]
    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Acquire) {
            0 => None,
            signum => Signal::try_from(signum).ok(),
        }
    }
}

impl SignalHandler for FlagHandler {
    fn handle_signal(&self, signal: Signal) -> i32 {
        self.last_signal.store(signal as i32, Ordering::Release);
        self.raised.store(true, Ordering::Release);
        0
    }
}

/// Store `action` in the asynchronous slot of `signal`, returning the old one.
fn publish(signal: Signal, action: SignalAction) -> SignalAction {
    let replaced = DISPATCH[slot_of(signal)].swap(Some(Arc::new(action)));
    match replaced {
        Some(previous) => {
            let action = SignalAction::clone(&previous);
            RETIRED.lock().push(previous);
            action
        }
        None => SignalAction::Ignore,
    }
}

/// Signal registration tables.
///
/// Asynchronous registrations are shared by every registry in the process;
/// synchronous ones are local to the registry.
pub struct SignalRegistry {
    synchronous: Mutex<Vec<SignalAction>>,
}

impl SignalRegistry {
    /// Create a registry with an empty synchronous table. No OS state is
    /// touched.
    #[must_use]
    pub fn new() -> Self {
        Self {
            synchronous: Mutex::new(vec![SignalAction::Ignore; SIGNAL_SLOTS]),
        }
    }

    /// Install `action` for `signal` under `discipline`.
    ///
    /// Returns the action previously installed under the same discipline.
    /// The entry in the other discipline is reset to [`SignalAction::Ignore`].
    /// Nothing changes when the OS refuses the registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal mask or disposition cannot be changed
    /// (for instance for `SIGKILL`).
    pub fn set_handler(
        &self,
        signal: Signal,
        action: SignalAction,
        discipline: Discipline,
    ) -> Result<SignalAction> {
        let slot = slot_of(signal);
        let previous = match discipline {
            Discipline::Synchronous => {
                block(signal)?;
                let previous = std::mem::replace(&mut self.synchronous.lock()[slot], action);
                self.enforce_exclusive(signal, Discipline::Synchronous);
                previous
            }
            Discipline::Asynchronous => {
                let handler = if matches!(action, SignalAction::Default) {
                    SigHandler::SigDfl
                } else {
                    SigHandler::Handler(dispatch)
                };
                install(signal, handler)?;
                let previous = publish(signal, action);
                self.enforce_exclusive(signal, Discipline::Asynchronous);
                unblock(signal)?;
                previous
            }
        };

        debug!(signal = %signal, ?discipline, "Signal handler installed");
        Ok(previous)
    }

    /// Reset the entry of `signal` in every discipline other than `keep`.
    fn enforce_exclusive(&self, signal: Signal, keep: Discipline) {
        let slot = slot_of(signal);
        match keep {
            Discipline::Synchronous => {
                if DISPATCH[slot].load().is_some() {
                    let _ = publish(signal, SignalAction::Ignore);
                }
            }
            Discipline::Asynchronous => self.synchronous.lock()[slot] = SignalAction::Ignore,
        }
    }

    /// Action currently installed for `signal` under `discipline`.
    #[must_use]
    pub fn handler(&self, signal: Signal, discipline: Discipline) -> SignalAction {
        let slot = slot_of(signal);
        match discipline {
            Discipline::Synchronous => self.synchronous.lock()[slot].clone(),
            Discipline::Asynchronous => DISPATCH[slot]
                .load()
                .as_deref()
                .map_or(SignalAction::Ignore, SignalAction::clone),
        }
    }

    /// Discipline under which `signal` has an active handler, if any.
    #[must_use]
    pub fn active_discipline(&self, signal: Signal) -> Option<Discipline> {
        if self.handler(signal, Discipline::Synchronous).is_active() {
            Some(Discipline::Synchronous)
        } else if self.handler(signal, Discipline::Asynchronous).is_active() {
            Some(Discipline::Asynchronous)
        } else {
            None
        }
    }

    /// Block until a signal with an active synchronous handler is pending,
    /// run that handler once and return the signal.
    ///
    /// `None` waits indefinitely. Interruptions by other signals are retried
    /// with the remaining time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the timeout elapses, or a signal error
    /// when no synchronous handler is registered or the wait itself fails.
    pub fn wait_signal(&self, timeout: Option<Duration>) -> Result<Signal> {
        let set = self.synchronous_set();
        if set.iter().next().is_none() {
            return Err(Error::signal("No synchronous signal handlers registered"));
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let received = loop {
            let result = match deadline {
                None => sys::wait(&set),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Past the deadline: one last non-blocking probe
                    sys::timed_wait(&set, remaining.max(Duration::from_nanos(1)))
                }
            };
            match result {
                Err(Errno::EINTR) => trace!("Signal wait interrupted, resuming"),
                other => break other,
            }
        };

        match received {
            Ok(signal) => {
                let action = self.synchronous.lock()[slot_of(signal)].clone();
                if let Some(status) = action.invoke(signal) {
                    trace!(signal = %signal, status, "Synchronous handler finished");
                }
                Ok(signal)
            }
            Err(Errno::EAGAIN) => Err(Error::timeout(
                "wait for signal",
                timeout.map_or(u64::MAX, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            )),
            Err(e) => Err(Error::signal(format!("Waiting for signals failed: {}", e.desc()))),
        }
    }

    fn synchronous_set(&self) -> SigSet {
        let table = self.synchronous.lock();
        let mut set = SigSet::empty();
        for signal in Signal::iterator() {
            if table.get(slot_of(signal)).is_some_and(SignalAction::is_active) {
                set.add(signal);
            }
        }
        set
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = |discipline| {
            Signal::iterator()
                .filter(|signal| self.active_discipline(*signal) == Some(discipline))
                .map(Signal::as_str)
                .collect::<Vec<_>>()
        };
        f.debug_struct("SignalRegistry")
            .field("synchronous", &active(Discipline::Synchronous))
            .field("asynchronous", &active(Discipline::Asynchronous))
            .finish()
    }
}

/// OS entry point for asynchronously registered signals.
extern "C" fn dispatch(signum: libc::c_int) {
    let Ok(signal) = Signal::try_from(signum) else {
        return;
    };
    if let Some(slot) = DISPATCH.get(slot_of(signal)) {
        if let Some(action) = &*slot.load() {
            let _ = action.invoke(signal);
        }
    }
}

fn slot_of(signal: Signal) -> usize {
    usize::try_from(signal as libc::c_int).unwrap_or_default()
}

fn block(signal: Signal) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(signal);
    nix_signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).map_err(|e| {
        Error::signal_with_source("Failed to block signal", signal as i32, e)
    })
}

fn unblock(signal: Signal) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(signal);
    nix_signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None).map_err(|e| {
        Error::signal_with_source("Failed to unblock signal", signal as i32, e)
    })
}

#[allow(unsafe_code)]
fn install(signal: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: `dispatch` only performs atomic loads and calls handlers that
    // are documented to be async-signal-safe.
    unsafe { nix_signal::sigaction(signal, &action) }
        .map(drop)
        .map_err(|e| Error::signal_with_source("Failed to install signal action", signal as i32, e))
}

#[allow(unsafe_code)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::signal::{SigSet, Signal};
    use std::time::Duration;

    fn to_signal(signum: libc::c_int) -> Result<Signal, Errno> {
        if signum < 0 {
            Err(Errno::last())
        } else {
            Signal::try_from(signum).map_err(|_| Errno::EINVAL)
        }
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    pub(super) fn wait(set: &SigSet) -> Result<Signal, Errno> {
        // SAFETY: `set` is an initialised sigset and a null info pointer is allowed.
        let signum = unsafe { libc::sigwaitinfo(set.as_ref(), std::ptr::null_mut()) };
        to_signal(signum)
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    pub(super) fn timed_wait(set: &SigSet, timeout: Duration) -> Result<Signal, Errno> {
        // SAFETY: timespec is plain old data.
        let mut spec: libc::timespec = unsafe { std::mem::zeroed() };
        spec.tv_sec = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
        spec.tv_nsec = libc::c_long::try_from(timeout.subsec_nanos()).unwrap_or_default();
        // SAFETY: both pointers reference live, initialised values.
        let signum = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &spec) };
        to_signal(signum)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd"
    )))]
    pub(super) fn wait(set: &SigSet) -> Result<Signal, Errno> {
        set.wait()
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd"
    )))]
    pub(super) fn timed_wait(set: &SigSet, timeout: Duration) -> Result<Signal, Errno> {
        poll_wait(set, timeout)
    }

    /// Timed wait built from `sigpending` and `sigwait`.
    #[cfg(any(
        test,
        not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd"
        ))
    ))]
    pub(super) fn poll_wait(set: &SigSet, timeout: Duration) -> Result<Signal, Errno> {
        const POLL_INTERVAL: Duration = Duration::from_millis(10);

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let ready = pending(set)?;
            if ready.iter().next().is_some() {
                return ready.wait();
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Errno::EAGAIN);
            }
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }

    /// Members of `set` pending for the calling thread or the process.
    #[cfg(any(
        test,
        not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd"
        ))
    ))]
    fn pending(set: &SigSet) -> Result<SigSet, Errno> {
        // SAFETY: sigset_t is plain old data and is filled in by sigpending.
        let mut raw: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: `raw` is a live, writable sigset.
        if unsafe { libc::sigpending(&mut raw) } < 0 {
            return Err(Errno::last());
        }
        let mut ready = SigSet::empty();
        for signal in set.iter() {
            // SAFETY: `raw` was initialised by sigpending.
            if unsafe { libc::sigismember(&raw, signal as libc::c_int) } == 1 {
                ready.add(signal);
            }
        }
        Ok(ready)
    }
}

/// Helper function to get a human-readable description of a signal.
#[must_use]
pub fn signal_description(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGHUP => "SIGHUP (Hangup)",
        Signal::SIGINT => "SIGINT (Interrupt/Ctrl+C)",
        Signal::SIGQUIT => "SIGQUIT (Quit)",
        Signal::SIGILL => "SIGILL (Illegal instruction)",
        Signal::SIGABRT => "SIGABRT (Abort)",
        Signal::SIGFPE => "SIGFPE (Floating-point exception)",
        Signal::SIGKILL => "SIGKILL (Kill - non-catchable)",
        Signal::SIGSEGV => "SIGSEGV (Segmentation fault)",
        Signal::SIGPIPE => "SIGPIPE (Broken pipe)",
        Signal::SIGALRM => "SIGALRM (Alarm clock)",
        Signal::SIGTERM => "SIGTERM (Terminate)",
        Signal::SIGUSR1 => "SIGUSR1 (User-defined 1)",
        Signal::SIGUSR2 => "SIGUSR2 (User-defined 2)",
        Signal::SIGCHLD => "SIGCHLD (Child status changed)",
        Signal::SIGTSTP => "SIGTSTP (Terminal stop)",
        Signal::SIGTTIN => "SIGTTIN (Background read from tty)",
        Signal::SIGTTOU => "SIGTTOU (Background write to tty)",
        Signal::SIGURG => "SIGURG (Urgent socket data)",
        Signal::SIGXCPU => "SIGXCPU (CPU time limit exceeded)",
        Signal::SIGXFSZ => "SIGXFSZ (File size limit exceeded)",
        other => other.as_str(),
    }
}
