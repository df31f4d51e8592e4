//! Reference daemon built on proc-detach.
//!
//! With `--state-dir` it leaves marker files that show where it is in its
//! lifecycle: `started` and `terminated` hold the pid, `reloads` counts reload
//! requests, `report` holds the uptime as
//! `days hours minutes seconds total-seconds` and `request` says whether the
//! stop was `graceful` or `fast`.
//!
//! ```text
//! detachd --daemon --state-dir /var/lib/detachd
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use proc_detach::{Application, Config, Daemon, Error, Options, Request, Result, RunOutcome};
use tracing::{info, warn};

const STATE_DIR: &str = "state-dir";
const FAIL_START: &str = "fail-start";

#[derive(Debug, Default)]
struct Heartbeat {
    state_dir: Option<PathBuf>,
    reloads: u32,
}

impl Heartbeat {
    fn mark(&self, name: &str, content: &str) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        fs::write(dir.join(name), content)
            .map_err(|e| Error::io_with_source(format!("Failed to write marker '{name}'"), e))
    }
}

impl Application for Heartbeat {
    fn start(&mut self, options: &Options) -> Result<()> {
        if options.switch(FAIL_START) {
            return Err(Error::application("Start refused (--fail-start)"));
        }
        self.state_dir = options.value(STATE_DIR).map(PathBuf::from);
        self.mark("started", &std::process::id().to_string())?;
        info!(state_dir = ?self.state_dir, "Heartbeat started");
        Ok(())
    }

    fn restart(&mut self) {
        self.reloads += 1;
        if let Err(e) = self.mark("reloads", &self.reloads.to_string()) {
            warn!(error = %e, "Failed to record reload");
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.mark("terminated", &std::process::id().to_string()) {
            warn!(error = %e, "Failed to record termination");
        }
        info!(reloads = self.reloads, "Heartbeat stopped");
    }
}

fn run() -> Result<ExitCode> {
    let mut config = Config::load()?;
    if config.description.is_empty() {
        config.description = String::from("Reference daemon that records its lifecycle in marker files");
    }

    let mut daemon = Daemon::builder(config, Heartbeat::default())
        .with_value_option(Some('s'), STATE_DIR, "Directory for lifecycle marker files")?
        .with_switch_option(None, FAIL_START, "Fail during application start")?
        .build()?;

    let outcome = daemon.run(std::env::args())?;
    match outcome {
        RunOutcome::Informational => {}
        RunOutcome::Completed(report) => {
            let uptime = report.uptime;
            daemon.app().mark(
                "report",
                &format!(
                    "{} {} {} {} {}",
                    uptime.days,
                    uptime.hours,
                    uptime.minutes,
                    uptime.seconds,
                    uptime.as_secs()
                ),
            )?;
            let request = match report.request {
                Request::FastTerminate => "fast",
                _ => "graceful",
            };
            daemon.app().mark("request", request)?;
            println!("{outcome}");
        }
        RunOutcome::Detached { .. } | RunOutcome::Aborted(_) => println!("{outcome}"),
    }

    Ok(ExitCode::from(daemon.last_error().exit_code()))
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("detachd: {e}");
            ExitCode::FAILURE
        }
    }
}
