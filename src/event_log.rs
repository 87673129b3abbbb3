//! Opt-in JSONL event log, one file per process start.
//!
//! Enabled by `--debug-events-dir <dir>` or `JUPYTER_MCP_DEBUG_EVENTS_DIR`.
//! When disabled every call here is a cheap no-op.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

pub const DEBUG_EVENTS_DIR_ENV: &str = "JUPYTER_MCP_DEBUG_EVENTS_DIR";
const RECORDED_ENV_PREFIX: &str = "JUPYTER_MCP_";
const RECORDED_ENV_EXTRA: [&str; 2] = ["VIRTUAL_ENV", "CONDA_PREFIX"];
const REDACTED: &str = "<redacted>";
const MAX_FILE_SUFFIX: u32 = 1_000;

static SINK: OnceLock<Option<EventSink>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct StartupContext {
    pub mode: String,
    pub working_dir: PathBuf,
    pub python_override: Option<PathBuf>,
}

#[derive(Serialize)]
struct Record<'a> {
    ts_unix_ms: u128,
    uptime_ms: u128,
    seq: u64,
    session_instance_id: &'a str,
    pid: u32,
    event: &'a str,
    payload: &'a JsonValue,
}

struct EventSink {
    out: Mutex<LineWriter<File>>,
    path: PathBuf,
    epoch: Instant,
    instance_id: String,
    pid: u32,
    seq: AtomicU64,
}

impl EventSink {
    fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let unix_ms = unix_ms_now();
        let pid = std::process::id();
        let (file, path) = open_log_file(dir, unix_ms, pid)?;
        Ok(Self {
            out: Mutex::new(LineWriter::new(file)),
            path,
            epoch: Instant::now(),
            instance_id: format!("{unix_ms}-{pid}"),
            pid,
            seq: AtomicU64::new(0),
        })
    }

    fn append(&self, event: &str, payload: &JsonValue) -> io::Result<()> {
        let record = Record {
            ts_unix_ms: unix_ms_now(),
            uptime_ms: self.epoch.elapsed().as_millis(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            session_instance_id: &self.instance_id,
            pid: self.pid,
            event,
            payload,
        };
        let line = serde_json::to_string(&record)?;
        let mut out = self.out.lock().unwrap();
        writeln!(out, "{line}")
    }
}

/// Picks `jupyter-mcp-<ms>-<pid>.jsonl`, adding `-<n>` until the name is free.
fn open_log_file(dir: &Path, unix_ms: u128, pid: u32) -> io::Result<(File, PathBuf)> {
    for suffix in 0..MAX_FILE_SUFFIX {
        let name = match suffix {
            0 => format!("jupyter-mcp-{unix_ms}-{pid}.jsonl"),
            n => format!("jupyter-mcp-{unix_ms}-{pid}-{n}.jsonl"),
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free event log name in {}", dir.display()),
    ))
}

/// Opens the log when a directory is configured and writes the `startup`
/// event. Later calls keep the first outcome.
pub fn initialize(
    debug_events_dir: Option<PathBuf>,
    context: StartupContext,
) -> Result<(), Box<dyn std::error::Error>> {
    if SINK.get().is_some() {
        return Ok(());
    }
    let dir = debug_events_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| {
            std::env::var_os(DEBUG_EVENTS_DIR_ENV)
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from)
        });
    let sink = match dir {
        Some(dir) => {
            let sink = EventSink::open(&dir)?;
            sink.append("startup", &startup_payload(&context, &sink.path))?;
            Some(sink)
        }
        None => None,
    };
    let _ = SINK.set(sink);
    Ok(())
}

fn sink() -> Option<&'static EventSink> {
    SINK.get().and_then(Option::as_ref)
}

pub fn log(event: &str, payload: JsonValue) {
    if let Some(sink) = sink() {
        let _ = sink.append(event, &payload);
    }
}

/// Like [`log`], but the payload is only built when logging is enabled.
pub fn log_lazy<F>(event: &str, payload: F)
where
    F: FnOnce() -> JsonValue,
{
    if let Some(sink) = sink() {
        let _ = sink.append(event, &payload());
    }
}

/// First `max_chars` characters of `text`, noting how many were cut.
pub fn text_preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let mut preview: String = chars.by_ref().take(max_chars).collect();
    let rest = chars.count();
    if rest > 0 {
        preview.push_str(&format!("... ({rest} more chars)"));
    }
    preview
}

fn startup_payload(context: &StartupContext, log_file: &Path) -> JsonValue {
    let lossy = |path: &Path| path.to_string_lossy().into_owned();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    json!({
        "mode": context.mode,
        "working_dir": lossy(context.working_dir.as_path()),
        "python_override": context.python_override.as_deref().map(lossy),
        "cwd": std::env::current_dir().ok().as_deref().map(lossy),
        "argv": argv,
        "log_file": lossy(log_file),
        "env": recorded_env(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.to_string_lossy().into_owned()))
        })),
    })
}

/// Server and interpreter-selection variables, with secret-looking values
/// replaced.
fn recorded_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            key.starts_with(RECORDED_ENV_PREFIX) || RECORDED_ENV_EXTRA.contains(&key.as_str())
        })
        .map(|(key, value)| {
            let value = if looks_secret(&key) {
                REDACTED.to_string()
            } else {
                value
            };
            (key, value)
        })
        .collect()
}

fn looks_secret(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["KEY", "TOKEN", "SECRET", "PASSWORD"]
        .into_iter()
        .any(|needle| upper.contains(needle))
}

pub(crate) fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_env_redacts_secret_values() {
        let env = vec![
            ("JUPYTER_MCP_PYTHON".to_string(), "/usr/bin/python3".to_string()),
            ("JUPYTER_MCP_API_TOKEN".to_string(), "hunter2".to_string()),
            ("VIRTUAL_ENV".to_string(), "/proj/.venv".to_string()),
            ("HOME".to_string(), "/home/me".to_string()),
        ];
        let recorded = recorded_env(env);
        insta::assert_debug_snapshot!(recorded, @r#"
        {
            "JUPYTER_MCP_API_TOKEN": "<redacted>",
            "JUPYTER_MCP_PYTHON": "/usr/bin/python3",
            "VIRTUAL_ENV": "/proj/.venv",
        }
        "#);
    }

    #[test]
    fn records_are_numbered_json_lines() {
        let temp = tempfile::tempdir().unwrap();
        let sink = EventSink::open(temp.path()).unwrap();
        sink.append("kernel_start_ready", &json!({"pid": 42})).unwrap();
        sink.append("kernel_shutdown", &json!({})).unwrap();

        let text = fs::read_to_string(&sink.path).unwrap();
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "kernel_start_ready");
        assert_eq!(lines[0]["payload"]["pid"], 42);
        assert_eq!(lines[0]["seq"], 1);
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[0]["session_instance_id"], lines[1]["session_instance_id"]);
    }

    #[test]
    fn taken_file_names_get_a_suffix() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("jupyter-mcp-123-456.jsonl"), "{}\n").unwrap();

        let (_file, path) = open_log_file(temp.path(), 123, 456).unwrap();
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("jupyter-mcp-123-456-1.jsonl")
        );
    }

    #[test]
    fn previews_note_the_cut() {
        assert_eq!(text_preview("print(1)", 20), "print(1)");
        assert_eq!(text_preview("abcdef", 4), "abcd... (2 more chars)");
    }
}
