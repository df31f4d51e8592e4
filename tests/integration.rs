//! Integration tests for proc-detach.

use proc_detach::{
    Application, Config, Daemon, ErrorCode, InstanceLock, LifecycleState, LogLevel, Options,
    Result, RunOutcome,
};
use std::time::Duration;
use tempfile::tempdir;

struct Idle;

impl Application for Idle {
    fn start(&mut self, _options: &Options) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_config_builder() {
    let dir = tempdir().unwrap();
    let config = Config::builder()
        .name("builder-test")
        .description("integration")
        .version("9.9.9", "2024-01-01T00:00:00Z")
        .log_level(LogLevel::Debug)
        .lock_file(dir.path().join("builder.lock"))
        .options_file(dir.path().join("options.toml"))
        .init_timeout(Duration::from_secs(2))
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(config.name, "builder-test");
    assert_eq!(config.version, "9.9.9");
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.init_timeout(), Duration::from_secs(2));
    assert_eq!(config.option_env_prefix(), "BUILDER_TEST_");
}

#[test]
fn test_options_file_feeds_daemon_options() {
    let dir = tempdir().unwrap();
    let options_file = dir.path().join("options.toml");
    std::fs::write(&options_file, "state-dir = \"/srv/state\"\nverbose = \"yes\"\n").unwrap();

    let config = Config::builder()
        .name("options-test")
        .lock_file(dir.path().join("options.lock"))
        .options_file(&options_file)
        .env_prefix("OPTIONS_INTEGRATION_TEST_")
        .build()
        .unwrap();

    let mut daemon = Daemon::builder(config, Idle)
        .with_value_option(Some('s'), "state-dir", "state directory")
        .unwrap()
        .with_switch_option(None, "verbose", "chatty output")
        .unwrap()
        .build()
        .unwrap();

    let outcome = daemon.run(["options-test", "--info", "extra"]).unwrap();
    assert_eq!(outcome, RunOutcome::Informational);
    assert_eq!(daemon.options().value("state-dir"), Some("/srv/state"));
    assert!(daemon.options().switch("verbose"));
    assert_eq!(daemon.options().arguments(), ["extra"]);
    assert!(!dir.path().join("options.lock").exists());
}

#[test]
fn test_daemon_refuses_when_lock_is_held() {
    let dir = tempdir().unwrap();
    let lock_path = dir.path().join("held.lock");

    let mut first = InstanceLock::new(&lock_path);
    assert!(first.try_lock().unwrap());

    let config = Config::builder()
        .name("held-test")
        .lock_file(&lock_path)
        .build()
        .unwrap();
    let mut daemon = Daemon::builder(config, Idle).build().unwrap();

    let outcome = daemon.run(["held-test"]).unwrap();
    assert_eq!(outcome, RunOutcome::Aborted(ErrorCode::AlreadyRunning));
    assert_eq!(daemon.last_error().exit_code(), 11);
    assert_eq!(daemon.state(), LifecycleState::OptionsParsed);
    drop(daemon);

    // The holder keeps both the lock and its file
    assert!(lock_path.exists());
    first.unlock().unwrap();
    let mut second = InstanceLock::new(&lock_path);
    assert!(second.try_lock().unwrap());
}

#[test]
fn test_error_code_round_trip_through_exit_status() {
    for code in ErrorCode::ALL {
        let status = i32::from(code.exit_code());
        assert_eq!(ErrorCode::from_exit_status(status), Some(code));
        assert!(code.to_string().starts_with(code.as_str()));
    }
}
