use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::event_log;

pub const CONNECTION_FILE_NAME: &str = ".kernel_connection.json";

/// Advisory record of a running session, written next to the project.
/// Readers must confirm the recorded processes are alive before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub session_id: String,
    pub pid: u32,
    pub server_pid: u32,
    pub python: PathBuf,
    pub working_dir: PathBuf,
    pub transport: String,
    pub protocol_version: u32,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingRecord {
    Absent,
    /// Recorded processes are gone; the file was removed.
    StaleRemoved(ConnectionRecord),
    /// Unreadable contents; the file was removed.
    CorruptRemoved,
    /// A different live server owns a kernel for this directory.
    LiveForeign(ConnectionRecord),
    /// Left by this server process for a kernel that is still alive.
    LiveOwned(ConnectionRecord),
}

pub fn path_for(working_dir: &Path) -> PathBuf {
    working_dir.join(CONNECTION_FILE_NAME)
}

/// Inspects any existing record, removing it when nothing recorded is alive.
pub fn reconcile(working_dir: &Path) -> ExistingRecord {
    reconcile_with(working_dir, process_alive)
}

fn reconcile_with<F>(working_dir: &Path, is_alive: F) -> ExistingRecord
where
    F: Fn(u32) -> bool,
{
    let path = path_for(working_dir);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => return ExistingRecord::Absent,
    };
    let Ok(record) = serde_json::from_str::<ConnectionRecord>(&text) else {
        let _ = fs::remove_file(&path);
        event_log::log(
            "connection_file_corrupt_removed",
            json!({ "path": path.to_string_lossy() }),
        );
        return ExistingRecord::CorruptRemoved;
    };

    let kernel_alive = is_alive(record.pid);
    let server_alive = is_alive(record.server_pid);
    if kernel_alive && server_alive {
        if record.server_pid == std::process::id() {
            return ExistingRecord::LiveOwned(record);
        }
        return ExistingRecord::LiveForeign(record);
    }

    let _ = fs::remove_file(&path);
    event_log::log(
        "connection_file_stale_removed",
        json!({
            "path": path.to_string_lossy(),
            "pid": record.pid,
            "server_pid": record.server_pid,
            "kernel_alive": kernel_alive,
            "server_alive": server_alive,
        }),
    );
    ExistingRecord::StaleRemoved(record)
}

pub fn write(working_dir: &Path, record: &ConnectionRecord) -> std::io::Result<()> {
    let path = path_for(working_dir);
    let tmp_path = working_dir.join(format!(".{CONNECTION_FILE_NAME}.tmp"));
    let text = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
    fs::write(&tmp_path, text)?;
    fs::rename(&tmp_path, &path)
}

/// Removes the record only if it still describes `pid`, so a newer session's
/// file is never deleted by an older one.
pub fn remove_if_owned(working_dir: &Path, pid: u32) {
    let path = path_for(working_dir);
    let owned = fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<ConnectionRecord>(&text).ok())
        .is_some_and(|record| record.pid == pid);
    if owned {
        let _ = fs::remove_file(&path);
    }
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(target).is_some()
}
