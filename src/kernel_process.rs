use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::environment::{EnvironmentDescriptor, Provenance};
use crate::error::KernelError;
use crate::event_log;
use crate::ipc::{IpcServer, KernelConnection, ServerToKernelMessage};

const DRIVER_SOURCE: &str = include_str!("../python/kernel_driver.py");
const STDERR_TAIL_LINES: usize = 40;
const EXIT_POLL: Duration = Duration::from_millis(20);
const TERM_WAIT: Duration = Duration::from_secs(2);

/// Last lines the kernel wrote to its raw stderr, kept for start-failure reports.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut guard = self.lines.lock().unwrap();
        if guard.len() == STDERR_TAIL_LINES {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    pub fn snapshot(&self) -> String {
        let guard = self.lines.lock().unwrap();
        guard.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// The OS process behind a session. Signals go to its whole process group.
pub struct KernelProcess {
    child: Child,
    stderr_tail: StderrTail,
    exit_status: Option<ExitStatus>,
    expected_exit: bool,
}

impl KernelProcess {
    pub fn spawn(
        environment: &EnvironmentDescriptor,
        working_dir: &Path,
        ipc_server: &mut IpcServer,
    ) -> Result<Self, KernelError> {
        #[cfg(not(target_family = "unix"))]
        {
            let _ = (environment, working_dir, ipc_server);
            Err(KernelError::Startup {
                message: "the kernel requires a unix platform".to_string(),
                stderr_tail: None,
            })
        }
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::process::CommandExt;

            use crate::ipc::{IPC_READ_FD_ENV, IPC_WRITE_FD_ENV};

            let mut command = Command::new(&environment.python);
            command
                .args(["-u", "-c", DRIVER_SOURCE])
                .current_dir(working_dir)
                .env("PYTHONUNBUFFERED", "1")
                .env("PYTHONIOENCODING", "utf-8")
                .env_remove("PYTHONSTARTUP");
            if std::env::var_os("MPLBACKEND").is_none() {
                command.env("MPLBACKEND", "Agg");
            }
            apply_environment_vars(&mut command, environment);

            let client_fds = ipc_server.take_child_fds().ok_or_else(|| {
                KernelError::Protocol("IPC pipe setup failed; no client fds available".to_string())
            })?;
            command.env(IPC_READ_FD_ENV, client_fds.read_fd.to_string());
            command.env(IPC_WRITE_FD_ENV, client_fds.write_fd.to_string());
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let spawned = command.spawn();
            crate::ipc::close_child_fds(client_fds);
            let mut child = spawned.map_err(|err| KernelError::Startup {
                message: format!(
                    "failed to launch {}: {err}",
                    environment.python.display()
                ),
                stderr_tail: None,
            })?;

            let stderr_tail = StderrTail::default();
            spawn_output_reader(child.stdout.take(), false, None);
            spawn_output_reader(child.stderr.take(), true, Some(stderr_tail.clone()));
            crate::diagnostics::startup_log(format!("kernel: spawned pid {}", child.id()));

            Ok(Self {
                child,
                stderr_tail,
                exit_status: None,
                expected_exit: false,
            })
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    pub fn is_running(&mut self) -> Result<bool, KernelError> {
        if self.exit_status.is_some() {
            return Ok(false);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_status = Some(status);
            if !status.success() && !self.expected_exit {
                event_log::log(
                    "kernel_exited",
                    json!({ "pid": self.child.id(), "status": format_exit_status(&status) }),
                );
            }
            return Ok(false);
        }
        Ok(true)
    }

    pub fn exit_status_message(&mut self) -> Option<String> {
        if self.exit_status.is_none()
            && let Ok(Some(status)) = self.child.try_wait()
        {
            self.exit_status = Some(status);
        }
        self.exit_status.as_ref().map(format_exit_status)
    }

    /// Asks the driver to exit, then escalates to SIGTERM and SIGKILL.
    pub fn shutdown_graceful(
        mut self,
        conn: Option<&KernelConnection>,
        grace: Duration,
    ) -> Result<(), KernelError> {
        self.expected_exit = true;
        if let Some(conn) = conn {
            let _ = conn.send(ServerToKernelMessage::Shutdown);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                self.exit_status = Some(status);
                break;
            }
            thread::sleep(EXIT_POLL);
        }

        if self.child.try_wait()?.is_none() {
            let sig_ok = self.send_signal(libc::SIGTERM).is_ok();
            if !sig_ok {
                self.kill_process_tree_scan(libc::SIGTERM);
            }
            let term_deadline = Instant::now() + TERM_WAIT;
            loop {
                if let Some(status) = self.child.try_wait()? {
                    self.exit_status = Some(status);
                    break;
                }
                if Instant::now() >= term_deadline {
                    self.force_kill();
                    break;
                }
                thread::sleep(EXIT_POLL);
            }
        }
        event_log::log(
            "kernel_stopped",
            json!({
                "pid": self.child.id(),
                "status": self.exit_status.as_ref().map(format_exit_status),
            }),
        );
        Ok(())
    }

    /// Immediate SIGKILL for a kernel judged hung.
    pub fn kill(mut self) {
        self.expected_exit = true;
        self.force_kill();
        event_log::log("kernel_killed", json!({ "pid": self.child.id() }));
    }

    fn force_kill(&mut self) {
        if self.send_signal(libc::SIGKILL).is_err() {
            self.kill_process_tree_scan(libc::SIGKILL);
        }
        if let Ok(status) = self.child.wait() {
            self.exit_status = Some(status);
        }
    }

    #[cfg(target_family = "unix")]
    fn send_signal(&self, signal: i32) -> Result<(), KernelError> {
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            // The process group is already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(KernelError::Io(err))
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn send_signal(&mut self, _signal: i32) -> Result<(), KernelError> {
        self.child.kill()?;
        Ok(())
    }

    /// Fallback when the process group cannot be signalled: walk the process
    /// table for descendants of the kernel.
    fn kill_process_tree_scan(&self, signal: i32) {
        let root = Pid::from_u32(self.child.id());
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (proc_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*proc_pid);
            }
        }

        let mut stack = vec![root];
        let mut seen: HashSet<Pid> = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)));
            }
        }

        #[cfg(target_family = "unix")]
        for pid in seen {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
        #[cfg(not(target_family = "unix"))]
        let _ = (seen, signal);
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            self.expected_exit = true;
            self.force_kill();
        }
    }
}

fn apply_environment_vars(command: &mut Command, environment: &EnvironmentDescriptor) {
    let bin_dir = environment.root.join("bin");
    match environment.provenance {
        Provenance::ManagedTool | Provenance::GenericVirtualenv => {
            command.env("VIRTUAL_ENV", &environment.root);
            command.env_remove("PYTHONHOME");
        }
        Provenance::Conda => {
            command.env("CONDA_PREFIX", &environment.root);
        }
        Provenance::System => return,
    }
    if !bin_dir.is_dir() {
        return;
    }
    let mut paths = vec![bin_dir];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    if let Ok(joined) = std::env::join_paths(paths) {
        command.env("PATH", joined);
    }
}

fn spawn_output_reader<R>(stream: Option<R>, is_stderr: bool, tail: Option<StderrTail>)
where
    R: Read + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    let event = if is_stderr {
        "kernel_stderr"
    } else {
        "kernel_stdout"
    };
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    event_log::log_lazy(event, || json!({ "line": line }));
                    if let Some(tail) = tail.as_ref() {
                        tail.push(line);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn format_exit_status(status: &ExitStatus) -> String {
    #[cfg(target_family = "unix")]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("kernel exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("kernel exited with status {code}"),
        None => "kernel exited with unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_only_the_last_lines() {
        let tail = StderrTail::default();
        for idx in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {idx}"));
        }
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 4\n"));
        assert!(snapshot.starts_with("line 5\n"));
        assert!(snapshot.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[test]
    fn driver_source_speaks_the_channel_protocol() {
        assert!(DRIVER_SOURCE.contains("JUPYTER_MCP_IPC_READ_FD"));
        assert!(DRIVER_SOURCE.contains("\"type\": \"ready\""));
        assert!(DRIVER_SOURCE.contains("\"execution_state\": \"idle\""));
    }

    #[test]
    fn driver_hides_channel_fds_from_user_code() {
        assert!(DRIVER_SOURCE.contains("os.environ.pop(variable)"));
        assert!(DRIVER_SOURCE.contains("os.set_inheritable(private, False)"));
    }
}
