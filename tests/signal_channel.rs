//! Signal channel behaviour that involves more than one thread.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::{raise, Signal};
use proc_detach::{Discipline, FlagHandler, Request, SignalAction, SignalRegistry};

#[test]
fn test_wait_resumes_after_asynchronous_interrupt() {
    let registry = SignalRegistry::new();
    let interrupt = FlagHandler::shared(Request::Acknowledge);
    let awaited = FlagHandler::shared(Request::GracefulExit);

    registry
        .set_handler(
            Signal::SIGUSR1,
            SignalAction::handler(Arc::clone(&interrupt)),
            Discipline::Asynchronous,
        )
        .unwrap();
    registry
        .set_handler(
            Signal::SIGUSR2,
            SignalAction::handler(Arc::clone(&awaited)),
            Discipline::Synchronous,
        )
        .unwrap();

    let waiter = pthread_self();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        pthread_kill(waiter, Signal::SIGUSR1).unwrap();
    });

    let budget = Duration::from_millis(400);
    let started = Instant::now();
    let result = registry.wait_signal(Some(budget));
    let elapsed = started.elapsed();
    sender.join().unwrap();

    assert!(result.unwrap_err().is_timeout());
    assert!(interrupt.take(), "asynchronous handler did not run");
    assert_eq!(interrupt.last_signal(), Some(Signal::SIGUSR1));
    assert!(!awaited.is_set());
    assert!(
        elapsed + Duration::from_millis(5) >= budget,
        "wait returned early after {elapsed:?}"
    );
    assert!(elapsed < budget + Duration::from_secs(2));
}

#[test]
fn test_wait_collects_signal_from_another_thread() {
    let registry = SignalRegistry::new();
    let reload = FlagHandler::shared(Request::Reload);
    registry
        .set_handler(
            Signal::SIGHUP,
            SignalAction::handler(Arc::clone(&reload)),
            Discipline::Synchronous,
        )
        .unwrap();

    let waiter = pthread_self();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        pthread_kill(waiter, Signal::SIGHUP).unwrap();
    });

    let received = registry.wait_signal(None).unwrap();
    sender.join().unwrap();

    assert_eq!(received, Signal::SIGHUP);
    assert!(reload.take());
    assert_eq!(reload.request(), Request::Reload);
}

#[test]
fn test_asynchronous_handlers_are_shared_between_registries() {
    let first = SignalRegistry::new();
    let second = SignalRegistry::new();
    let urgent = FlagHandler::shared(Request::Acknowledge);

    first
        .set_handler(
            Signal::SIGURG,
            SignalAction::handler(Arc::clone(&urgent)),
            Discipline::Asynchronous,
        )
        .unwrap();
    second
        .set_handler(Signal::SIGPROF, SignalAction::Ignore, Discipline::Asynchronous)
        .unwrap();
    let refused = second.set_handler(
        Signal::SIGKILL,
        SignalAction::handler(FlagHandler::shared(Request::FastTerminate)),
        Discipline::Asynchronous,
    );
    assert!(refused.is_err());

    assert_eq!(
        second.active_discipline(Signal::SIGURG),
        Some(Discipline::Asynchronous)
    );

    raise(Signal::SIGURG).unwrap();
    assert!(urgent.take(), "first registry's handler did not run");
    assert_eq!(urgent.last_signal(), Some(Signal::SIGURG));
}
