#![cfg_attr(not(target_family = "unix"), allow(dead_code))]

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::event_log;
use crate::kernel_protocol::{MimeBundle, StreamName};

pub const IPC_READ_FD_ENV: &str = "JUPYTER_MCP_IPC_READ_FD";
pub const IPC_WRITE_FD_ENV: &str = "JUPYTER_MCP_IPC_WRITE_FD";
pub const PROTOCOL_VERSION: u32 = 1;
const MALFORMED_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToKernelMessage {
    Execute {
        request_id: String,
        code: String,
        execution_count: u64,
    },
    Ping {
        nonce: u64,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Busy,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub language: String,
    pub version: String,
    pub pid: u32,
    pub executable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelToServerMessage {
    Ready(KernelInfo),
    Status {
        request_id: String,
        execution_state: ExecutionState,
    },
    Stream {
        request_id: String,
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        request_id: String,
        data: MimeBundle,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
        execution_count: u64,
    },
    DisplayData {
        request_id: String,
        data: MimeBundle,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
    },
    Error {
        request_id: String,
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    Pong {
        nonce: u64,
        #[serde(default)]
        busy: bool,
    },
    /// Any other object with a string `type`; the whole object is kept.
    #[serde(skip_deserializing)]
    Other {
        msg_type: String,
        request_id: Option<String>,
        content: Value,
    },
}

impl KernelToServerMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            KernelToServerMessage::Status { request_id, .. }
            | KernelToServerMessage::Stream { request_id, .. }
            | KernelToServerMessage::ExecuteResult { request_id, .. }
            | KernelToServerMessage::DisplayData { request_id, .. }
            | KernelToServerMessage::Error { request_id, .. } => Some(request_id),
            KernelToServerMessage::Other { request_id, .. } => request_id.as_deref(),
            KernelToServerMessage::Ready(_) | KernelToServerMessage::Pong { .. } => None,
        }
    }
}

const KNOWN_KERNEL_MESSAGE_TYPES: [&str; 7] = [
    "ready",
    "status",
    "stream",
    "execute_result",
    "display_data",
    "error",
    "pong",
];

/// One line of kernel output. Unknown `type` tags become `Other`; anything
/// that is not a typed JSON object is an error for the caller to count.
pub(crate) fn parse_kernel_line(line: &str) -> Result<KernelToServerMessage, String> {
    let value: Value = serde_json::from_str(line).map_err(|err| format!("invalid json: {err}"))?;
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Err("message has no string `type` field".to_string());
    };
    if KNOWN_KERNEL_MESSAGE_TYPES.contains(&kind.as_str()) {
        return serde_json::from_value(value).map_err(|err| format!("invalid {kind} message: {err}"));
    }
    let request_id = value
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(KernelToServerMessage::Other {
        msg_type: kind,
        request_id,
        content: value,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpcWaitError {
    #[error("timed out waiting for kernel message")]
    Timeout,
    #[error("kernel channel disconnected")]
    Disconnected,
}

#[derive(Default)]
struct KernelInbox {
    queue: VecDeque<KernelToServerMessage>,
    pongs: VecDeque<(u64, bool)>,
    ready: Option<KernelInfo>,
    malformed: u64,
    disconnected: bool,
}

/// Server end of the kernel channel. Clones share one inbox.
#[derive(Clone)]
pub struct KernelConnection {
    sender: mpsc::Sender<ServerToKernelMessage>,
    inbox: Arc<Mutex<KernelInbox>>,
    cvar: Arc<Condvar>,
}

impl KernelConnection {
    fn new(transport: IpcTransport) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(KernelInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let IpcTransport { reader, writer } = transport;
        let shared = (inbox.clone(), cvar.clone());
        thread::Builder::new()
            .name("kernel-ipc-reader".to_string())
            .spawn(move || read_kernel_lines(reader, &shared.0, &shared.1))?;

        spawn_writer(rx, writer)?;

        Ok(Self {
            sender: tx,
            inbox,
            cvar,
        })
    }

    pub fn send(&self, message: ServerToKernelMessage) -> io::Result<()> {
        self.sender
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "kernel channel writer closed"))
    }

    /// Next queued execution-side message, waiting at most `timeout`.
    pub fn recv(&self, timeout: Duration) -> Result<KernelToServerMessage, IpcWaitError> {
        self.wait_for(timeout, |inbox| inbox.queue.pop_front())
    }

    pub fn wait_for_ready(&self, timeout: Duration) -> Result<KernelInfo, IpcWaitError> {
        self.wait_for(timeout, |inbox| inbox.ready.take())
    }

    /// Round-trips a ping. Returns whether the kernel reported user code running.
    pub fn ping(&self, nonce: u64, timeout: Duration) -> Result<bool, IpcWaitError> {
        self.send(ServerToKernelMessage::Ping { nonce })
            .map_err(|_| IpcWaitError::Disconnected)?;
        // Pongs for older nonces belong to probes that already gave up.
        self.wait_for(timeout, |inbox| {
            while let Some((seen, busy)) = inbox.pongs.pop_front() {
                if seen == nonce {
                    return Some(busy);
                }
            }
            None
        })
    }

    /// Blocks until `take` yields a value. Anything still buffered is
    /// delivered before a disconnect is reported.
    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut KernelInbox) -> Option<T>,
    ) -> Result<T, IpcWaitError> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if let Some(value) = take(&mut inbox) {
                return Ok(value);
            }
            if inbox.disconnected {
                return Err(IpcWaitError::Disconnected);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(IpcWaitError::Timeout);
            }
            inbox = self.cvar.wait_timeout(inbox, remaining).unwrap().0;
        }
    }

    /// Drops every queued execution message, returning how many were dropped.
    pub fn discard_pending(&self) -> usize {
        let mut guard = self.inbox.lock().unwrap();
        let dropped = guard.queue.len();
        guard.queue.clear();
        dropped
    }

    pub fn malformed_count(&self) -> u64 {
        self.inbox.lock().unwrap().malformed
    }

    pub fn is_disconnected(&self) -> bool {
        let guard = self.inbox.lock().unwrap();
        guard.disconnected && guard.queue.is_empty()
    }
}

/// Reader thread body: one JSON message per line until EOF or a read error.
fn read_kernel_lines(reader: Box<dyn Read + Send>, inbox: &Mutex<KernelInbox>, cvar: &Condvar) {
    let mut lines = BufReader::new(reader).lines();
    while let Some(Ok(line)) = lines.next() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let parsed = parse_kernel_line(line);
        let mut guard = inbox.lock().unwrap();
        match parsed {
            Ok(KernelToServerMessage::Ready(info)) => guard.ready = Some(info),
            Ok(KernelToServerMessage::Pong { nonce, busy }) => guard.pongs.push_back((nonce, busy)),
            Ok(message) => guard.queue.push_back(message),
            Err(err) => {
                guard.malformed = guard.malformed.saturating_add(1);
                event_log::log(
                    "ipc_malformed_message",
                    json!({
                        "error": err,
                        "line": event_log::text_preview(line, MALFORMED_PREVIEW_CHARS),
                    }),
                );
            }
        }
        cvar.notify_all();
    }
    inbox.lock().unwrap().disconnected = true;
    cvar.notify_all();
}

fn spawn_writer<T>(rx: mpsc::Receiver<T>, mut writer: Box<dyn Write + Send>) -> io::Result<()>
where
    T: Serialize + Send + 'static,
{
    thread::Builder::new()
        .name("kernel-ipc-writer".to_string())
        .spawn(move || {
            for message in rx {
                if let Ok(payload) = serde_json::to_string(&message) {
                    if writer.write_all(payload.as_bytes()).is_err() {
                        break;
                    }
                    if writer.write_all(b"\n").is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }
        })?;
    Ok(())
}

struct IpcTransport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

/// Pipe pair created before the kernel is spawned. The child ends are
/// inherited through the environment variables above.
pub struct IpcServer {
    #[cfg(target_family = "unix")]
    server_read: Option<std::io::PipeReader>,
    #[cfg(target_family = "unix")]
    server_write: Option<std::io::PipeWriter>,
    #[cfg(target_family = "unix")]
    child_fds: Option<IpcChildFds>,
}

#[cfg(target_family = "unix")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IpcChildFds {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl IpcServer {
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_family = "unix")]
        {
            let (server_read, server_write, child_read, child_write) = create_pipe_pair()?;
            Ok(Self {
                server_read: Some(server_read),
                server_write: Some(server_write),
                child_fds: Some(IpcChildFds {
                    read_fd: child_read,
                    write_fd: child_write,
                }),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the kernel channel requires unix pipes",
            ))
        }
    }

    #[cfg(target_family = "unix")]
    pub fn connect(mut self) -> io::Result<KernelConnection> {
        let Some(server_read) = self.server_read.take() else {
            return Err(io::Error::other("missing ipc read pipe"));
        };
        let Some(server_write) = self.server_write.take() else {
            return Err(io::Error::other("missing ipc write pipe"));
        };
        let conn = KernelConnection::new(IpcTransport {
            reader: Box::new(server_read),
            writer: Box::new(server_write),
        })?;
        crate::diagnostics::startup_log("ipc: connected");
        Ok(conn)
    }

    #[cfg(not(target_family = "unix"))]
    pub fn connect(self) -> io::Result<KernelConnection> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the kernel channel requires unix pipes",
        ))
    }

    #[cfg(target_family = "unix")]
    pub(crate) fn take_child_fds(&mut self) -> Option<IpcChildFds> {
        self.child_fds.take()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        // Child fds are normally closed by the spawner right after fork; this
        // covers spawn failures.
        #[cfg(target_family = "unix")]
        if let Some(fds) = self.child_fds.take() {
            close_child_fds(fds);
        }
    }
}

#[cfg(target_family = "unix")]
pub(crate) fn close_child_fds(fds: IpcChildFds) {
    unsafe {
        libc::close(fds.read_fd);
        libc::close(fds.write_fd);
    }
}

#[cfg(target_family = "unix")]
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn create_pipe_pair() -> io::Result<(std::io::PipeReader, std::io::PipeWriter, RawFd, RawFd)> {
    let (server_read, child_write) = std::io::pipe()?;
    let (child_read, server_write) = std::io::pipe()?;

    let child_read_fd = child_read.into_raw_fd();
    let child_write_fd = child_write.into_raw_fd();

    set_cloexec(child_read_fd, false)?;
    set_cloexec(child_write_fd, false)?;
    set_cloexec(server_read.as_raw_fd(), true)?;
    set_cloexec(server_write.as_raw_fd(), true)?;

    Ok((server_read, server_write, child_read_fd, child_write_fd))
}

/// Kernel side of an in-memory channel, driven by tests in place of the
/// Python driver.
#[cfg(test)]
pub(crate) struct FakeKernelEnd {
    reader: BufReader<std::io::PipeReader>,
    writer: Option<std::io::PipeWriter>,
}

#[cfg(test)]
impl FakeKernelEnd {
    pub(crate) fn send(&mut self, message: &KernelToServerMessage) {
        let line = serde_json::to_string(message).expect("serialize kernel message");
        self.send_raw(&line);
    }

    pub(crate) fn send_raw(&mut self, line: &str) {
        let writer = self.writer.as_mut().expect("fake kernel writer open");
        writer.write_all(line.as_bytes()).expect("write line");
        writer.write_all(b"\n").expect("write newline");
        writer.flush().expect("flush");
    }

    pub(crate) fn recv(&mut self) -> ServerToKernelMessage {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read server message");
        serde_json::from_str(line.trim_end()).expect("parse server message")
    }

    /// Closes the kernel's write side, as if the process had exited.
    pub(crate) fn hang_up(&mut self) {
        self.writer = None;
    }
}

#[cfg(test)]
pub(crate) fn test_connection_pair() -> io::Result<(KernelConnection, FakeKernelEnd)> {
    let (server_read, kernel_write) = std::io::pipe()?;
    let (kernel_read, server_write) = std::io::pipe()?;
    let server = KernelConnection::new(IpcTransport {
        reader: Box::new(server_read),
        writer: Box::new(server_write),
    })?;
    Ok((
        server,
        FakeKernelEnd {
            reader: BufReader::new(kernel_read),
            writer: Some(kernel_write),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn unknown_type_becomes_other_with_full_object() {
        let message =
            parse_kernel_line(r#"{"type":"clear_output","request_id":"r1","wait":true}"#)
                .expect("parse");
        match message {
            KernelToServerMessage::Other {
                msg_type,
                request_id,
                content,
            } => {
                assert_eq!(msg_type, "clear_output");
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(content["wait"], true);
            }
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn known_type_with_bad_shape_is_rejected() {
        let err = parse_kernel_line(r#"{"type":"stream","request_id":"r1","name":"stdout"}"#)
            .expect_err("missing text");
        assert!(err.contains("invalid stream message"), "{err}");
        assert!(parse_kernel_line("not json at all").is_err());
        assert!(parse_kernel_line(r#"{"no_type": 1}"#).is_err());
    }

    #[test]
    fn malformed_lines_are_counted_and_skipped() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send_raw("{garbage");
        kernel.send(&KernelToServerMessage::Stream {
            request_id: "r1".to_string(),
            name: StreamName::Stdout,
            text: "hello\n".to_string(),
        });
        let message = conn.recv(WAIT).expect("stream after garbage");
        assert!(matches!(message, KernelToServerMessage::Stream { ref text, .. } if text == "hello\n"));
        assert_eq!(conn.malformed_count(), 1);
    }

    #[test]
    fn ready_and_pong_bypass_the_execution_queue() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        kernel.send(&KernelToServerMessage::Ready(KernelInfo {
            language: "python".to_string(),
            version: "3.12.1".to_string(),
            pid: 4242,
            executable: "/proj/.venv/bin/python".to_string(),
        }));
        let info = conn.wait_for_ready(WAIT).expect("ready");
        assert_eq!(info.pid, 4242);

        let pinger = {
            let conn = conn.clone();
            thread::spawn(move || conn.ping(7, WAIT))
        };
        assert_eq!(kernel.recv(), ServerToKernelMessage::Ping { nonce: 7 });
        kernel.send(&KernelToServerMessage::Pong { nonce: 6, busy: false });
        kernel.send(&KernelToServerMessage::Pong { nonce: 7, busy: true });
        assert_eq!(pinger.join().expect("join"), Ok(true));
        assert_eq!(conn.discard_pending(), 0);
    }

    #[test]
    fn recv_times_out_then_reports_disconnect() {
        let (conn, mut kernel) = test_connection_pair().expect("pair");
        let started = Instant::now();
        assert_eq!(
            conn.recv(Duration::from_millis(50)),
            Err(IpcWaitError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(50));

        kernel.hang_up();
        assert_eq!(conn.recv(WAIT), Err(IpcWaitError::Disconnected));
        assert!(conn.is_disconnected());
    }
}
