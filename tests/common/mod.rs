#![allow(dead_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent};
use rmcp::service::ServiceError;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Variables that would steer the server away from the test's own settings.
const SCRUBBED_ENV: [&str; 5] = [
    "JUPYTER_MCP_WORKING_DIR",
    "JUPYTER_MCP_PYTHON",
    "JUPYTER_MCP_EXECUTION_TIMEOUT_SECS",
    "JUPYTER_MCP_STARTUP_TIMEOUT_SECS",
    "JUPYTER_MCP_DEBUG_EVENTS_DIR",
];

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

/// Decoded tool response: the JSON payload of the first text item plus flags.
#[derive(Debug)]
pub struct ToolResponse {
    pub payload: Value,
    pub is_error: bool,
    pub image_count: usize,
}

impl ToolResponse {
    pub fn status(&self) -> &str {
        self.payload["status"].as_str().unwrap_or("")
    }

    pub fn category(&self) -> &str {
        self.payload["category"].as_str().unwrap_or("")
    }

    /// Concatenated stdout stream text of an execution payload.
    pub fn stdout(&self) -> String {
        self.payload["outputs"]
            .as_array()
            .map(|outputs| {
                outputs
                    .iter()
                    .filter(|output| {
                        output["output_type"] == "stream" && output["name"] == "stdout"
                    })
                    .filter_map(|output| output["text"].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn execution_count(&self) -> u64 {
        self.payload["execution_count"].as_u64().unwrap_or(0)
    }
}

fn decode(result: &CallToolResult) -> ToolResponse {
    let mut payload = Value::Null;
    let mut image_count = 0;
    for content in &result.content {
        match &content.raw {
            RawContent::Text(text) if payload.is_null() => {
                payload = serde_json::from_str(&text.text)
                    .unwrap_or_else(|_| Value::String(text.text.clone()));
            }
            RawContent::Image(_) => image_count += 1,
            _ => {}
        }
    }
    ToolResponse {
        payload,
        is_error: result.is_error == Some(true),
        image_count,
    }
}

pub struct McpTestSession {
    service: rmcp::service::RunningService<rmcp::service::RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    pub async fn tool_names(&self) -> TestResult<Vec<String>> {
        let tools = self.service.list_all_tools().await?;
        let mut names: Vec<String> = tools.into_iter().map(|tool| tool.name.to_string()).collect();
        names.sort();
        Ok(names)
    }

    pub async fn call_tool_raw(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self.service
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
            })
            .await
    }

    pub async fn call(&self, tool: &str, arguments: Value) -> TestResult<ToolResponse> {
        let result = self.call_tool_raw(tool, arguments).await?;
        Ok(decode(&result))
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub async fn spawn_server(working_dir: &Path) -> TestResult<McpTestSession> {
    spawn_server_with_args(working_dir, Vec::new()).await
}

/// Server whose kernel runs the first available system Python.
pub async fn spawn_python_server(working_dir: &Path) -> TestResult<McpTestSession> {
    let python = python_program().ok_or("python is not available")?;
    spawn_server_with_args(working_dir, vec!["--python".to_string(), python.to_string()]).await
}

pub async fn spawn_server_with_args(
    working_dir: &Path,
    args: Vec<String>,
) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let working_dir = working_dir.to_path_buf();
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        for key in SCRUBBED_ENV {
            cmd.env_remove(key);
        }
        cmd.arg("--working-dir").arg(&working_dir);
        cmd.args(&args);
        cmd.current_dir(&working_dir);
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
    })
}

pub fn python_available() -> bool {
    python_program().is_some()
}

pub fn python_program() -> Option<&'static str> {
    static PROGRAM: OnceLock<Option<&'static str>> = OnceLock::new();
    *PROGRAM.get_or_init(|| {
        ["python3", "python"].into_iter().find(|program| {
            std::process::Command::new(program)
                .args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 8) else 1)"])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        })
    })
}

/// Prints a skip notice and returns true when the test needs Python but none exists.
pub fn skip_without_python(test: &str) -> bool {
    if python_available() {
        return false;
    }
    eprintln!("{test}: python is not available; skipping");
    true
}

pub fn resolve_server_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_jupyter-mcp") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("jupyter-mcp");
    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate jupyter-mcp test binary".into())
    }
}

#[cfg(unix)]
fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn terminate_process_tree(_pid: u32) {}
