//! Opt-in plain-text trace of server and kernel bring-up.
//!
//! Enabled by `JUPYTER_MCP_DEBUG_STARTUP` (writes `jupyter-mcp-startup.log` in
//! the current directory) or `JUPYTER_MCP_DEBUG_STARTUP_FILE=<path>`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const STARTUP_LOG_ENV: &str = "JUPYTER_MCP_DEBUG_STARTUP";
const STARTUP_LOG_PATH_ENV: &str = "JUPYTER_MCP_DEBUG_STARTUP_FILE";
const STARTUP_LOG_DEFAULT: &str = "jupyter-mcp-startup.log";

static TRACE: OnceLock<StartupTrace> = OnceLock::new();

struct StartupTrace {
    epoch: Instant,
    target: Option<PathBuf>,
    file: OnceLock<Option<Mutex<File>>>,
}

impl StartupTrace {
    fn from_env() -> Self {
        let path = env_value(STARTUP_LOG_PATH_ENV).map(PathBuf::from);
        let target = match path {
            Some(path) => Some(path),
            None => env_value(STARTUP_LOG_ENV).map(|_| PathBuf::from(STARTUP_LOG_DEFAULT)),
        };
        Self {
            epoch: Instant::now(),
            target,
            file: OnceLock::new(),
        }
    }

    fn write(&self, message: &str) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        // Opened on first write so a disabled trace never touches the disk.
        let file = self.file.get_or_init(|| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(target)
                .ok()
                .map(Mutex::new)
        });
        let Some(file) = file else {
            return;
        };
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(
                file,
                "[jupyter-mcp][startup +{:>6}ms] {message}",
                self.epoch.elapsed().as_millis()
            );
            let _ = file.flush();
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn trace() -> &'static StartupTrace {
    TRACE.get_or_init(StartupTrace::from_env)
}

/// Call early in `main` so elapsed times are measured from process start.
pub fn mark_startup_epoch() {
    let _ = trace();
}

pub fn startup_log(message: impl AsRef<str>) {
    trace().write(message.as_ref());
}

/// Logs `<name>: begin` now and `<name>: done in N ms` when dropped.
pub fn startup_phase(name: &'static str) -> StartupPhase {
    let trace = trace();
    let started = trace.target.is_some().then(|| {
        trace.write(&format!("{name}: begin"));
        Instant::now()
    });
    StartupPhase { name, started }
}

#[must_use = "the phase ends when the guard is dropped"]
pub struct StartupPhase {
    name: &'static str,
    started: Option<Instant>,
}

impl Drop for StartupPhase {
    fn drop(&mut self) {
        if let Some(started) = self.started {
            trace().write(&format!(
                "{}: done in {} ms",
                self.name,
                started.elapsed().as_millis()
            ));
        }
    }
}
