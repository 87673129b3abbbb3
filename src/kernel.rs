use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::classify::{self, ErrorClassification};
use crate::config::KernelConfig;
use crate::connection_file::{self, ConnectionRecord, ExistingRecord};
use crate::diagnostics;
use crate::environment::{self, EnvironmentDescriptor};
use crate::error::{FailureCategory, KernelError};
use crate::event_log;
use crate::inspect::{self, ProfileReport, ProfileSort, VariableDetail, VariableSummary};
use crate::ipc::{
    ExecutionState, IpcServer, IpcWaitError, KernelConnection, KernelInfo, KernelToServerMessage,
    PROTOCOL_VERSION, ServerToKernelMessage,
};
use crate::kernel_process::KernelProcess;
use crate::kernel_protocol::{ExecutionFailure, ExecutionResult, ResultEvent};
use crate::normalize::{DrainOutcome, normalize};

const CODE_PREVIEW_CHARS: usize = 2_000;
const EXIT_SETTLE: Duration = Duration::from_millis(500);
const EXIT_SETTLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    NotStarted,
    Starting,
    Ready,
    Executing,
    Dead,
}

impl KernelState {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelState::NotStarted => "not_started",
            KernelState::Starting => "starting",
            KernelState::Ready => "ready",
            KernelState::Executing => "executing",
            KernelState::Dead => "dead",
        }
    }

    fn is_live(self) -> bool {
        matches!(self, KernelState::Ready | KernelState::Executing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub status: StartStatus,
    pub session_id: String,
    pub pid: u32,
    pub python: PathBuf,
    pub python_version: String,
    pub environment: EnvironmentDescriptor,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStatus {
    Stopped,
    NotRunning,
}

/// Point-in-time view of the supervisor, readable while an execution holds
/// the supervisor itself.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub state: KernelState,
    pub running: bool,
    pub pid: Option<u32>,
    pub execution_count: u64,
    pub session_id: Option<String>,
    pub python: Option<PathBuf>,
    pub provenance: Option<String>,
    pub started_at_unix_ms: Option<u64>,
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start_failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub execution_count: u64,
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastErrorReport {
    #[serde(flatten)]
    pub error: LastError,
    pub classification: ErrorClassification,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceReport {
    pub execution_count: u64,
    pub variables: Vec<VariableSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileRun {
    pub sort_by: ProfileSort,
    /// Missing when the code did not compile or the kernel failed mid-run.
    pub profile: Option<ProfileReport>,
    pub execution: ExecutionResult,
}

struct Session {
    process: KernelProcess,
    conn: KernelConnection,
    environment: EnvironmentDescriptor,
    info: KernelInfo,
    session_id: String,
    started_at_unix_ms: u64,
}

/// Owns at most one interpreter process and serializes every execution
/// against it. Callers share it behind a mutex.
pub struct KernelSupervisor {
    config: KernelConfig,
    state: KernelState,
    session: Option<Session>,
    execution_count: u64,
    next_request: u64,
    next_nonce: u64,
    last_error: Option<LastError>,
    last_start_failure: Option<String>,
    status: Arc<Mutex<KernelStatus>>,
}

impl KernelSupervisor {
    pub fn new(config: KernelConfig) -> Self {
        let status = KernelStatus {
            state: KernelState::NotStarted,
            running: false,
            pid: None,
            execution_count: 0,
            session_id: None,
            python: None,
            provenance: None,
            started_at_unix_ms: None,
            working_dir: config.working_dir.clone(),
            last_start_failure: None,
        };
        Self {
            config,
            state: KernelState::NotStarted,
            session: None,
            execution_count: 0,
            next_request: 0,
            next_nonce: 0,
            last_error: None,
            last_start_failure: None,
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.session_id.as_str())
    }

    /// Environment of the running session.
    pub fn environment(&self) -> Option<&EnvironmentDescriptor> {
        self.session.as_ref().map(|session| &session.environment)
    }

    pub fn status_handle(&self) -> Arc<Mutex<KernelStatus>> {
        self.status.clone()
    }

    /// Points later starts at a different project. The running session, if
    /// any, is left alone; callers restart to apply it.
    pub fn set_working_dir(&mut self, working_dir: PathBuf) {
        self.config.working_dir = working_dir;
        self.publish_status();
    }

    pub fn start(&mut self) -> Result<StartReport, KernelError> {
        if self.state == KernelState::Ready && self.session_alive() {
            let session = self.session.as_ref().ok_or_else(|| {
                KernelError::Protocol("ready state without a session".to_string())
            })?;
            return Ok(start_report(session, StartStatus::AlreadyRunning, Vec::new()));
        }
        if self.session.is_some() {
            self.teardown_dead_session("replaced by a new start");
        }

        self.set_state(KernelState::Starting);
        event_log::log(
            "kernel_start_begin",
            json!({ "working_dir": self.config.working_dir.to_string_lossy() }),
        );
        match self.launch() {
            Ok((session, warnings)) => {
                let report = start_report(&session, StartStatus::Started, warnings);
                self.session = Some(session);
                self.last_start_failure = None;
                self.set_state(KernelState::Ready);
                event_log::log(
                    "kernel_start_ready",
                    json!({
                        "session_id": report.session_id,
                        "pid": report.pid,
                        "python": report.python.to_string_lossy(),
                        "provenance": report.environment.provenance.as_str(),
                    }),
                );
                Ok(report)
            }
            Err(err) => {
                self.last_start_failure = Some(err.to_string());
                self.set_state(KernelState::Dead);
                event_log::log(
                    "kernel_start_failure",
                    json!({ "error": err.to_string(), "category": err.category().as_str() }),
                );
                Err(err)
            }
        }
    }

    fn launch(&mut self) -> Result<(Session, Vec<String>), KernelError> {
        let _phase = diagnostics::startup_phase("kernel launch");
        let working_dir = self.config.working_dir.clone();
        if !working_dir.is_dir() {
            return Err(KernelError::Startup {
                message: format!("working directory {} does not exist", working_dir.display()),
                stderr_tail: None,
            });
        }
        let resolved =
            environment::resolve_interpreter(&working_dir, self.config.python_override.as_deref())?;
        let mut warnings: Vec<String> = resolved.warning.into_iter().collect();
        if let ExistingRecord::LiveForeign(record) = connection_file::reconcile(&working_dir) {
            warnings.push(format!(
                "another server (pid {}) has a live kernel (pid {}) for this directory",
                record.server_pid, record.pid
            ));
        }

        let mut ipc_server = IpcServer::bind()?;
        let mut process = KernelProcess::spawn(&resolved.environment, &working_dir, &mut ipc_server)?;
        let conn = match ipc_server.connect() {
            Ok(conn) => conn,
            Err(err) => {
                process.kill();
                return Err(err.into());
            }
        };

        let info = match conn.wait_for_ready(self.config.startup_timeout) {
            Ok(info) => info,
            Err(IpcWaitError::Timeout) => {
                process.kill();
                return Err(KernelError::StartupTimeout(self.config.startup_timeout));
            }
            Err(IpcWaitError::Disconnected) => {
                settle_exit(&mut process);
                let status = process
                    .exit_status_message()
                    .unwrap_or_else(|| "kernel closed its channel".to_string());
                let tail = process.stderr_tail();
                process.kill();
                return Err(KernelError::Startup {
                    message: status,
                    stderr_tail: (!tail.trim().is_empty()).then_some(tail),
                });
            }
        };

        let started_at_unix_ms = event_log::unix_ms_now() as u64;
        let pid = process.pid();
        let session_id = format!("kernel-{pid}-{started_at_unix_ms}");
        let record = ConnectionRecord {
            session_id: session_id.clone(),
            pid,
            server_pid: std::process::id(),
            python: resolved.environment.python.clone(),
            working_dir: working_dir.clone(),
            transport: "pipe".to_string(),
            protocol_version: PROTOCOL_VERSION,
            started_at_unix_ms,
        };
        if let Err(err) = connection_file::write(&working_dir, &record) {
            event_log::log(
                "connection_file_write_failed",
                json!({ "error": err.to_string() }),
            );
        }

        Ok((
            Session {
                process,
                conn,
                environment: resolved.environment,
                info,
                session_id,
                started_at_unix_ms,
            },
            warnings,
        ))
    }

    pub fn execute_code(
        &mut self,
        source: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, KernelError> {
        self.run_code(source, timeout, true)
    }

    fn run_code(
        &mut self,
        source: &str,
        timeout: Duration,
        record_error: bool,
    ) -> Result<ExecutionResult, KernelError> {
        if source.trim().is_empty() {
            return Err(KernelError::EmptySource);
        }
        if timeout.is_zero() {
            return Err(KernelError::InvalidRequest(
                "timeout must be positive".to_string(),
            ));
        }
        if !(self.state == KernelState::Ready && self.session_alive()) {
            self.start()?;
        }
        let Some(conn) = self.session.as_ref().map(|session| session.conn.clone()) else {
            return Err(KernelError::ProcessDied("no kernel session".to_string()));
        };

        let stale = conn.discard_pending();
        if stale > 0 {
            event_log::log("late_events_discarded", json!({ "count": stale }));
        }
        self.execution_count += 1;
        self.next_request += 1;
        let execution_count = self.execution_count;
        let request_id = format!("req-{}-{}", std::process::id(), self.next_request);
        self.set_state(KernelState::Executing);
        event_log::log_lazy("execute_begin", || {
            json!({
                "request_id": request_id,
                "execution_count": execution_count,
                "code": event_log::text_preview(source, CODE_PREVIEW_CHARS),
                "timeout_ms": timeout.as_millis(),
            })
        });

        let submitted = conn.send(ServerToKernelMessage::Execute {
            request_id: request_id.clone(),
            code: source.to_string(),
            execution_count,
        });
        let malformed_before = conn.malformed_count();
        let drained = match submitted {
            Ok(()) => {
                let message_wait = self.config.message_wait;
                let mut session = self.session.as_mut();
                let mut alive = || session_running(session.as_deref_mut());
                drain_execution(&conn, &request_id, timeout, message_wait, &mut alive)
            }
            Err(_) => Drained {
                events: Vec::new(),
                late: 0,
                stop: DrainStop::Disconnected,
            },
        };
        let malformed = conn.malformed_count().saturating_sub(malformed_before);

        let mut outcome = DrainOutcome {
            events: drained.events,
            failure: None,
            failure_remediation: Vec::new(),
            skipped_messages: drained.late + malformed,
        };
        match drained.stop {
            DrainStop::Idle => self.set_state(KernelState::Ready),
            DrainStop::TimedOut => {
                let responsive = self.probe(&conn);
                let kernel_state = if responsive {
                    self.set_state(KernelState::Ready);
                    KernelState::Ready
                } else {
                    self.teardown_dead_session("unresponsive after timeout");
                    KernelState::Dead
                };
                outcome.failure = Some(ExecutionFailure {
                    category: FailureCategory::Timeout,
                    message: format!(
                        "execution did not finish within {} s",
                        timeout.as_secs_f64()
                    ),
                    kernel_state: kernel_state.as_str().to_string(),
                });
                outcome.failure_remediation = classify::timeout_remediation(timeout);
            }
            DrainStop::Disconnected => {
                let message = self
                    .session
                    .as_mut()
                    .and_then(|session| {
                        settle_exit(&mut session.process);
                        session.process.exit_status_message()
                    })
                    .unwrap_or_else(|| "kernel closed its channel".to_string());
                self.teardown_dead_session("process exited during execution");
                outcome.failure = Some(ExecutionFailure {
                    category: FailureCategory::ProcessDied,
                    message,
                    kernel_state: KernelState::Dead.as_str().to_string(),
                });
                outcome.failure_remediation = classify::process_died_remediation();
            }
        }

        let result = normalize(outcome, execution_count);
        if record_error && let Some((ename, evalue, traceback)) = result.first_error() {
            self.last_error = Some(LastError {
                execution_count,
                ename: ename.to_string(),
                evalue: evalue.to_string(),
                traceback: traceback.to_vec(),
            });
        }
        event_log::log_lazy("execute_end", || {
            json!({
                "request_id": request_id,
                "execution_count": execution_count,
                "has_error": result.has_error,
                "outputs": result.outputs.len(),
                "failure": result.failure.as_ref().map(|failure| failure.category.as_str()),
                "skipped_messages": result.skipped_messages,
            })
        });
        Ok(result)
    }

    /// No-op round trip to tell a busy kernel from a hung or dead one.
    fn probe(&mut self, conn: &KernelConnection) -> bool {
        self.next_nonce += 1;
        let outcome = conn.ping(self.next_nonce, self.config.probe_timeout);
        event_log::log(
            "liveness_probe",
            json!({
                "nonce": self.next_nonce,
                "alive": outcome.is_ok(),
                "busy": outcome.as_ref().ok().copied(),
            }),
        );
        outcome.is_ok()
    }

    pub fn inspect_state(
        &mut self,
        filter: Option<&str>,
        timeout: Duration,
    ) -> Result<NamespaceReport, KernelError> {
        let snippet = inspect::namespace_snippet(filter);
        let result = self.run_code(&snippet, timeout, false)?;
        check_introspection(&result, timeout)?;
        Ok(NamespaceReport {
            execution_count: result.execution_count,
            variables: inspect::parse_namespace(&result)?,
        })
    }

    pub fn inspect_variable(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<VariableDetail, KernelError> {
        let snippet = inspect::variable_snippet(name)?;
        let result = self.run_code(&snippet, timeout, false)?;
        check_introspection(&result, timeout)?;
        inspect::parse_variable(&result)
    }

    /// Runs `code` in the user namespace under cProfile. Exceptions are recorded
    /// like any other execution and still produce a report.
    pub fn profile_code(
        &mut self,
        code: &str,
        sort_by: ProfileSort,
        timeout: Duration,
    ) -> Result<ProfileRun, KernelError> {
        if code.trim().is_empty() {
            return Err(KernelError::EmptySource);
        }
        let snippet = inspect::profile_snippet(code, sort_by);
        let mut execution = self.run_code(&snippet, timeout, true)?;
        let profile = inspect::take_profile(&mut execution);
        Ok(ProfileRun {
            sort_by,
            profile,
            execution,
        })
    }

    pub fn last_error(&self) -> Option<LastErrorReport> {
        let error = self.last_error.clone()?;
        let classification = classify::classify(&error.ename, &error.evalue, &error.traceback);
        Some(LastErrorReport {
            error,
            classification,
        })
    }

    pub fn shutdown(&mut self) -> ShutdownStatus {
        let Some(session) = self.session.take() else {
            self.set_state(KernelState::NotStarted);
            return ShutdownStatus::NotRunning;
        };
        let Session {
            process,
            conn,
            session_id,
            ..
        } = session;
        let pid = process.pid();
        if let Err(err) = process.shutdown_graceful(Some(&conn), self.config.shutdown_grace) {
            event_log::log(
                "kernel_shutdown_error",
                json!({ "session_id": session_id, "error": err.to_string() }),
            );
        }
        connection_file::remove_if_owned(&self.config.working_dir, pid);
        self.set_state(KernelState::NotStarted);
        event_log::log("kernel_shutdown", json!({ "session_id": session_id, "pid": pid }));
        ShutdownStatus::Stopped
    }

    pub fn restart(&mut self) -> Result<StartReport, KernelError> {
        self.shutdown();
        self.start()
    }

    /// Current status, first noticing a kernel that died while idle.
    pub fn status(&mut self) -> KernelStatus {
        if self.state == KernelState::Ready && !self.session_alive() {
            self.teardown_dead_session("exited while idle");
        }
        self.status.lock().unwrap().clone()
    }

    fn session_alive(&mut self) -> bool {
        session_running(self.session.as_mut())
    }

    fn teardown_dead_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            let pid = session.process.pid();
            event_log::log(
                "kernel_dead",
                json!({ "session_id": session.session_id, "pid": pid, "reason": reason }),
            );
            session.process.kill();
            connection_file::remove_if_owned(&self.config.working_dir, pid);
        }
        self.set_state(KernelState::Dead);
    }

    fn set_state(&mut self, state: KernelState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let mut status = self.status.lock().unwrap();
        status.state = self.state;
        status.running = self.state.is_live();
        status.execution_count = self.execution_count;
        status.working_dir = self.config.working_dir.clone();
        status.last_start_failure = self.last_start_failure.clone();
        match self.session.as_ref() {
            Some(session) => {
                status.pid = Some(session.process.pid());
                status.session_id = Some(session.session_id.clone());
                status.python = Some(session.environment.python.clone());
                status.provenance = Some(session.environment.provenance.as_str().to_string());
                status.started_at_unix_ms = Some(session.started_at_unix_ms);
            }
            None => {
                status.pid = None;
                status.session_id = None;
                status.python = None;
                status.provenance = None;
                status.started_at_unix_ms = None;
            }
        }
    }
}

impl Drop for KernelSupervisor {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pid = session.process.pid();
            session.process.kill();
            connection_file::remove_if_owned(&self.config.working_dir, pid);
        }
    }
}

fn start_report(session: &Session, status: StartStatus, warnings: Vec<String>) -> StartReport {
    StartReport {
        status,
        session_id: session.session_id.clone(),
        pid: session.process.pid(),
        python: session.environment.python.clone(),
        python_version: session.info.version.clone(),
        environment: session.environment.clone(),
        warnings,
    }
}

fn session_running(session: Option<&mut Session>) -> bool {
    session.is_some_and(|session| {
        !session.conn.is_disconnected() && session.process.is_running().unwrap_or(false)
    })
}

/// Gives a process that closed its channel a moment to be reaped so its exit
/// status and stderr are available.
fn settle_exit(process: &mut KernelProcess) {
    let deadline = Instant::now() + EXIT_SETTLE;
    while Instant::now() < deadline {
        if !process.is_running().unwrap_or(false) {
            return;
        }
        thread::sleep(EXIT_SETTLE_POLL);
    }
}

fn check_introspection(result: &ExecutionResult, timeout: Duration) -> Result<(), KernelError> {
    if let Some(failure) = result.failure.as_ref() {
        return Err(match failure.category {
            FailureCategory::Timeout => KernelError::Timeout(timeout),
            _ => KernelError::ProcessDied(failure.message.clone()),
        });
    }
    if let Some((ename, evalue, _)) = result.first_error() {
        return Err(KernelError::InvalidRequest(format!("{ename}: {evalue}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStop {
    Idle,
    TimedOut,
    Disconnected,
}

struct Drained {
    events: Vec<ResultEvent>,
    late: u64,
    stop: DrainStop,
}

/// Collects events for `request_id` until its idle marker. Each wait is
/// bounded by `message_wait` and the whole drain by `timeout`; after a silent
/// wait `still_running` decides whether to keep waiting.
fn drain_execution<F>(
    conn: &KernelConnection,
    request_id: &str,
    timeout: Duration,
    message_wait: Duration,
    still_running: &mut F,
) -> Drained
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    let mut late = 0u64;
    let stop = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break DrainStop::TimedOut;
        }
        let message = match conn.recv(remaining.min(message_wait)) {
            Ok(message) => message,
            Err(IpcWaitError::Timeout) => {
                if !still_running() {
                    break DrainStop::Disconnected;
                }
                continue;
            }
            Err(IpcWaitError::Disconnected) => break DrainStop::Disconnected,
        };
        if message.request_id() != Some(request_id) {
            late += 1;
            event_log::log_lazy("late_event_discarded", || {
                json!({
                    "expected": request_id,
                    "request_id": message.request_id(),
                })
            });
            continue;
        }
        match message {
            KernelToServerMessage::Status {
                execution_state: ExecutionState::Idle,
                ..
            } => break DrainStop::Idle,
            KernelToServerMessage::Status { .. } => {}
            KernelToServerMessage::Stream { name, text, .. } => {
                events.push(ResultEvent::Stream { name, text });
            }
            KernelToServerMessage::ExecuteResult {
                data,
                metadata,
                execution_count,
                ..
            } => events.push(ResultEvent::ExecuteResult {
                data,
                metadata,
                execution_count,
            }),
            KernelToServerMessage::DisplayData { data, metadata, .. } => {
                events.push(ResultEvent::DisplayData { data, metadata });
            }
            KernelToServerMessage::Error {
                ename,
                evalue,
                traceback,
                ..
            } => events.push(ResultEvent::Error {
                ename,
                evalue,
                traceback,
            }),
            KernelToServerMessage::Other {
                msg_type, content, ..
            } => events.push(ResultEvent::Other { msg_type, content }),
            KernelToServerMessage::Ready(_) | KernelToServerMessage::Pong { .. } => {}
        }
    };
    Drained { events, late, stop }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::test_connection_pair;
    use crate::kernel_protocol::StreamName;

    const WAIT: Duration = Duration::from_secs(5);

    fn stream(request_id: &str, text: &str) -> KernelToServerMessage {
        KernelToServerMessage::Stream {
            request_id: request_id.to_string(),
            name: StreamName::Stdout,
            text: text.to_string(),
        }
    }

    fn status(request_id: &str, execution_state: ExecutionState) -> KernelToServerMessage {
        KernelToServerMessage::Status {
            request_id: request_id.to_string(),
            execution_state,
        }
    }

    #[test]
    fn drain_stops_at_idle_and_discards_late_events() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send(&stream("old", "late output\n"));
        kernel.send(&status("r2", ExecutionState::Busy));
        kernel.send(&stream("r2", "hello\n"));
        kernel.send(&KernelToServerMessage::Error {
            request_id: "r2".to_string(),
            ename: "ValueError".to_string(),
            evalue: "bad".to_string(),
            traceback: vec![],
        });
        kernel.send(&status("old", ExecutionState::Idle));
        kernel.send(&status("r2", ExecutionState::Idle));
        kernel.send(&stream("r2", "after idle\n"));

        let drained = drain_execution(&conn, "r2", WAIT, WAIT, &mut || true);
        assert_eq!(drained.stop, DrainStop::Idle);
        assert_eq!(drained.late, 2);
        assert_eq!(drained.events.len(), 2);
        assert_eq!(drained.events[0], ResultEvent::stdout("hello\n"));
        assert!(drained.events[1].is_error());
    }

    #[test]
    fn drain_times_out_with_partial_output() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send(&stream("r1", "tick\n"));
        let started = Instant::now();
        let drained = drain_execution(
            &conn,
            "r1",
            Duration::from_millis(300),
            Duration::from_millis(50),
            &mut || true,
        );
        assert_eq!(drained.stop, DrainStop::TimedOut);
        assert_eq!(drained.events, vec![ResultEvent::stdout("tick\n")]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[test]
    fn drain_reports_disconnect_and_dead_process() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send(&stream("r1", "partial\n"));
        kernel.hang_up();
        let drained = drain_execution(&conn, "r1", WAIT, WAIT, &mut || true);
        assert_eq!(drained.stop, DrainStop::Disconnected);
        assert_eq!(drained.events.len(), 1);

        let (conn, _kernel) = test_connection_pair().expect("pair");
        let drained = drain_execution(&conn, "r1", WAIT, Duration::from_millis(20), &mut || false);
        assert_eq!(drained.stop, DrainStop::Disconnected);
    }

    #[test]
    fn unknown_messages_become_opaque_events() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send_raw(r#"{"type":"clear_output","request_id":"r1","wait":false}"#);
        kernel.send(&status("r1", ExecutionState::Idle));
        let drained = drain_execution(&conn, "r1", WAIT, WAIT, &mut || true);
        assert!(matches!(
            drained.events.as_slice(),
            [ResultEvent::Other { msg_type, .. }] if msg_type == "clear_output"
        ));
    }

    #[test]
    fn empty_source_is_rejected_without_starting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut supervisor = KernelSupervisor::new(KernelConfig::new(temp.path().to_path_buf()));
        let err = supervisor
            .execute_code("   \n", WAIT)
            .expect_err("empty source");
        assert!(matches!(err, KernelError::EmptySource));
        assert_eq!(supervisor.execution_count(), 0);
        assert_eq!(supervisor.state(), KernelState::NotStarted);
    }

    #[test]
    fn shutdown_without_a_session_is_not_running_every_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut supervisor = KernelSupervisor::new(KernelConfig::new(temp.path().to_path_buf()));
        assert_eq!(supervisor.shutdown(), ShutdownStatus::NotRunning);
        assert_eq!(supervisor.shutdown(), ShutdownStatus::NotRunning);
        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.state, KernelState::NotStarted);
    }

    #[test]
    fn failed_start_marks_dead_and_keeps_the_counter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = KernelConfig::new(temp.path().to_path_buf());
        config.python_override = Some(temp.path().join("missing-python"));
        let mut supervisor = KernelSupervisor::new(config);

        let err = supervisor
            .execute_code("print(1)", WAIT)
            .expect_err("start fails");
        assert_eq!(err.category(), FailureCategory::StartupFailure);
        assert_eq!(supervisor.state(), KernelState::Dead);
        assert_eq!(supervisor.execution_count(), 0);
        let status = supervisor.status();
        assert!(status.last_start_failure.is_some());
        assert!(!connection_file::path_for(temp.path()).exists());
    }
}
