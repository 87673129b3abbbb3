use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use toml_edit::DocumentMut;

use crate::event_log;

pub const UV_PROGRAM_ENV: &str = "JUPYTER_MCP_UV";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const UV_INSTALL_HINT: &str = "Install uv: curl -LsSf https://astral.sh/uv/install.sh | sh";
const CONVENTIONAL_VENV_DIRS: [&str; 4] = ["venv", "env", ".env", "virtualenv"];

/// How an environment came to exist. Lower priority rank means preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    ManagedTool,
    GenericVirtualenv,
    Conda,
    System,
}

impl Provenance {
    pub fn priority(self) -> u8 {
        match self {
            Provenance::ManagedTool => 1,
            Provenance::GenericVirtualenv => 2,
            Provenance::Conda => 3,
            Provenance::System => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::ManagedTool => "managed_tool",
            Provenance::GenericVirtualenv => "generic_virtualenv",
            Provenance::Conda => "conda",
            Provenance::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentDescriptor {
    pub root: PathBuf,
    pub python: PathBuf,
    pub provenance: Provenance,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

impl EnvironmentDescriptor {
    fn new(root: PathBuf, python: PathBuf, provenance: Provenance) -> Self {
        Self {
            root,
            python,
            provenance,
            priority: provenance.priority(),
            name: None,
            python_version: None,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.provenance != Provenance::System
    }

    pub fn describe(&self) -> String {
        match self.provenance {
            Provenance::ManagedTool => format!("uv-managed venv at {}", self.root.display()),
            Provenance::GenericVirtualenv => {
                format!("virtual environment at {}", self.root.display())
            }
            Provenance::Conda => format!(
                "conda environment '{}'",
                self.name.as_deref().unwrap_or("unknown")
            ),
            Provenance::System => format!(
                "system Python at {} (consider creating a virtual environment)",
                self.python.display()
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("{tool} is not installed or not on PATH")]
    ToolNotInstalled { tool: String },
    #[error("Python {version} is not available: {detail}")]
    VersionUnavailable { version: String, detail: String },
    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("`{command}` did not finish within {} s", .timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },
    #[error("no Python interpreter found for {}", .0.display())]
    NoInterpreter(PathBuf),
    #[error("environment io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvironmentError {
    pub fn remediation(&self) -> Vec<String> {
        match self {
            EnvironmentError::ToolNotInstalled { tool } if tool == "uv" => {
                vec![UV_INSTALL_HINT.to_string()]
            }
            EnvironmentError::ToolNotInstalled { tool } => {
                vec![format!("Install {tool} and make sure it is on PATH")]
            }
            EnvironmentError::VersionUnavailable { version, .. } => vec![
                format!("Install the interpreter with: uv python install {version}"),
                "Or pass a different python_version".to_string(),
            ],
            EnvironmentError::CommandFailed { .. } => {
                vec!["Check the command output above and the project configuration".to_string()]
            }
            EnvironmentError::CommandTimeout { .. } => {
                vec!["Retry; the package index may be slow or unreachable".to_string()]
            }
            EnvironmentError::NoInterpreter(_) => vec![
                "Create a project environment with jupyter_setup_environment".to_string(),
                "Or set JUPYTER_MCP_PYTHON to an interpreter path".to_string(),
            ],
            EnvironmentError::Io(_) => Vec::new(),
        }
    }
}

/// Filesystem and process probing inputs, captured once so tests can supply
/// their own instead of the host's.
#[derive(Debug, Clone)]
pub struct Detector {
    home: Option<PathBuf>,
    path_var: Option<OsString>,
    conda_prefix: Option<PathBuf>,
    query_conda: bool,
    probe_versions: bool,
}

impl Detector {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var_os("HOME").map(PathBuf::from),
            path_var: std::env::var_os("PATH"),
            conda_prefix: std::env::var_os("CONDA_PREFIX")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            query_conda: true,
            probe_versions: true,
        }
    }

    /// Ranked by provenance priority, discovery order within a rank.
    pub fn detect(&self, root: &Path) -> Vec<EnvironmentDescriptor> {
        let mut found: Vec<EnvironmentDescriptor> = Vec::new();

        if let Some(env) = self.find_dot_venv(root) {
            push_unique(&mut found, env);
        }
        for name in CONVENTIONAL_VENV_DIRS {
            let dir = root.join(name);
            if !dir.is_dir() {
                continue;
            }
            if let Some(python) = venv_python(&dir) {
                let mut env =
                    EnvironmentDescriptor::new(dir.clone(), python, Provenance::GenericVirtualenv);
                env.python_version = self.version_for(&env);
                push_unique(&mut found, env);
            }
        }
        for env in self.conda_environments() {
            push_unique(&mut found, env);
        }
        if let Some(env) = self.system_python() {
            push_unique(&mut found, env);
        }

        found.sort_by_key(|env| env.priority);
        found
    }

    fn find_dot_venv(&self, start: &Path) -> Option<EnvironmentDescriptor> {
        let stop_at_home = self
            .home
            .as_ref()
            .filter(|home| start.starts_with(home))
            .cloned();

        let mut dir = start.to_path_buf();
        loop {
            let venv = dir.join(".venv");
            if let Some(python) = venv_python(&venv) {
                let provenance = if dir.join("uv.lock").is_file() || created_by_uv(&venv) {
                    Provenance::ManagedTool
                } else {
                    Provenance::GenericVirtualenv
                };
                let mut env = EnvironmentDescriptor::new(venv, python, provenance);
                env.python_version = self.version_for(&env);
                return Some(env);
            }

            if let Some(stop) = stop_at_home.as_ref()
                && &dir == stop
            {
                break;
            }
            let parent = dir.parent()?;
            if parent == dir {
                break;
            }
            dir = parent.to_path_buf();
        }
        None
    }

    fn conda_environments(&self) -> Vec<EnvironmentDescriptor> {
        let mut roots: Vec<PathBuf> = self.conda_prefix.iter().cloned().collect();
        if self.query_conda
            && let Some(conda) = find_program_on_path(self.path_var.as_ref(), "conda")
        {
            let mut command = Command::new(conda);
            command.args(["env", "list", "--json"]);
            match run_with_timeout(command, PROBE_TIMEOUT) {
                Ok(output) if output.status.success() => {
                    roots.extend(parse_conda_env_list(&output.stdout));
                }
                Ok(output) => {
                    event_log::log(
                        "conda_env_list_failed",
                        json!({ "stderr": output.stderr.trim() }),
                    );
                }
                Err(err) => {
                    event_log::log("conda_env_list_failed", json!({ "error": err.to_string() }));
                }
            }
        }

        let mut out: Vec<EnvironmentDescriptor> = Vec::new();
        for root in roots {
            if out.iter().any(|env| env.root == root) {
                continue;
            }
            let python = root.join("bin").join("python");
            if !python.is_file() {
                continue;
            }
            let mut env = EnvironmentDescriptor::new(root.clone(), python, Provenance::Conda);
            env.name = root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            env.python_version = self.version_for(&env);
            out.push(env);
        }
        out
    }

    fn system_python(&self) -> Option<EnvironmentDescriptor> {
        let python = find_program_on_path(self.path_var.as_ref(), "python3")
            .or_else(|| find_program_on_path(self.path_var.as_ref(), "python"))?;
        let root = python.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut env = EnvironmentDescriptor::new(root, python, Provenance::System);
        env.python_version = self.version_for(&env);
        Some(env)
    }

    fn version_for(&self, env: &EnvironmentDescriptor) -> Option<String> {
        if let Some(version) = pyvenv_cfg_value(&env.root, &["version_info", "version"]) {
            return Some(version);
        }
        if !self.probe_versions {
            return None;
        }
        interpreter_version(&env.python)
    }
}

fn push_unique(found: &mut Vec<EnvironmentDescriptor>, env: EnvironmentDescriptor) {
    if !found.iter().any(|existing| existing.root == env.root) {
        found.push(env);
    }
}

/// Re-probes the filesystem on every call.
pub fn detect_environments(root: &Path) -> Vec<EnvironmentDescriptor> {
    Detector::from_env().detect(root)
}

#[derive(Debug, Clone)]
pub struct ResolvedInterpreter {
    pub environment: EnvironmentDescriptor,
    pub warning: Option<String>,
}

/// Picks the interpreter for a new session. An explicit override skips detection.
pub fn resolve_interpreter(
    root: &Path,
    python_override: Option<&Path>,
) -> Result<ResolvedInterpreter, EnvironmentError> {
    if let Some(python) = python_override {
        return Ok(ResolvedInterpreter {
            environment: descriptor_for_interpreter(python),
            warning: None,
        });
    }
    let Some(environment) = detect_environments(root).into_iter().next() else {
        return Err(EnvironmentError::NoInterpreter(root.to_path_buf()));
    };
    let warning = (!environment.is_isolated()).then(|| {
        format!(
            "no isolated project environment found under {}; using {}",
            root.display(),
            environment.python.display()
        )
    });
    Ok(ResolvedInterpreter {
        environment,
        warning,
    })
}

fn descriptor_for_interpreter(python: &Path) -> EnvironmentDescriptor {
    let bin_dir = python.parent().map(Path::to_path_buf).unwrap_or_default();
    let env_root = bin_dir.parent().map(Path::to_path_buf);
    match env_root {
        Some(root) if root.join("pyvenv.cfg").is_file() => {
            let provenance = if created_by_uv(&root) {
                Provenance::ManagedTool
            } else {
                Provenance::GenericVirtualenv
            };
            let mut env = EnvironmentDescriptor::new(root.clone(), python.to_path_buf(), provenance);
            env.python_version = pyvenv_cfg_value(&root, &["version_info", "version"]);
            env
        }
        Some(root) if root.join("conda-meta").is_dir() => {
            let mut env = EnvironmentDescriptor::new(root.clone(), python.to_path_buf(), Provenance::Conda);
            env.name = root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            env
        }
        _ => EnvironmentDescriptor::new(bin_dir, python.to_path_buf(), Provenance::System),
    }
}

/// Runs `uv venv` for `<root>/.venv`. The version defaults to the project's request.
pub fn create_managed_environment(
    root: &Path,
    python_version: Option<&str>,
) -> Result<EnvironmentDescriptor, EnvironmentError> {
    let uv = uv_program().ok_or_else(|| EnvironmentError::ToolNotInstalled {
        tool: "uv".to_string(),
    })?;
    let version = python_version
        .map(str::to_string)
        .or_else(|| detect_python_version(root));
    let venv = root.join(".venv");

    let mut command = Command::new(&uv);
    command.arg("venv").arg(&venv).current_dir(root);
    if let Some(version) = version.as_deref() {
        command.args(["--python", version]);
    }
    let output = run_with_timeout(command, TOOL_TIMEOUT)?;
    event_log::log(
        "environment_create",
        json!({
            "root": root.to_string_lossy(),
            "python_version": version,
            "status": output.status.code(),
        }),
    );
    if !output.status.success() {
        let detail = output.stderr.trim().to_string();
        if let Some(version) = version
            && looks_like_missing_interpreter(&detail)
        {
            return Err(EnvironmentError::VersionUnavailable { version, detail });
        }
        return Err(EnvironmentError::CommandFailed {
            command: "uv venv".to_string(),
            detail,
        });
    }

    let python = venv_python(&venv).ok_or_else(|| EnvironmentError::CommandFailed {
        command: "uv venv".to_string(),
        detail: format!("no interpreter found in {}", venv.display()),
    })?;
    let mut env = EnvironmentDescriptor::new(venv.clone(), python, Provenance::ManagedTool);
    env.python_version = pyvenv_cfg_value(&venv, &["version_info", "version"]);
    Ok(env)
}

fn looks_like_missing_interpreter(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no interpreter found")
        || lower.contains("no python")
        || (lower.contains("python") && lower.contains("not found"))
}

/// `.python-version` first, then the `project.requires-python` floor in `pyproject.toml`.
pub fn detect_python_version(root: &Path) -> Option<String> {
    if let Ok(text) = fs::read_to_string(root.join(".python-version")) {
        let version = text.lines().next().unwrap_or_default().trim();
        if !version.is_empty() {
            return Some(version.to_string());
        }
    }
    let doc = read_pyproject(root)?;
    let requirement = doc
        .get("project")
        .and_then(|project| project.get("requires-python"))
        .and_then(|item| item.as_str())?;
    static RE: std::sync::OnceLock<regex_lite::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex_lite::Regex::new(r"(\d+\.\d+)").expect("failed to compile python version regex")
    });
    let (_, [version]) = re.captures(requirement)?.extract();
    Some(version.to_string())
}

fn read_pyproject(root: &Path) -> Option<DocumentMut> {
    let text = fs::read_to_string(root.join("pyproject.toml")).ok()?;
    text.parse::<DocumentMut>().ok()
}

pub fn declared_dependencies(root: &Path) -> Vec<String> {
    let Some(doc) = read_pyproject(root) else {
        return Vec::new();
    };
    doc.get("project")
        .and_then(|project| project.get("dependencies"))
        .and_then(|item| item.as_array())
        .map(|array| {
            array
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub working_dir: PathBuf,
    pub uv_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_version: Option<String>,
    pub venv: Option<PathBuf>,
    pub uv_lock_exists: bool,
    pub pyproject_exists: bool,
    pub python_version: Option<String>,
    pub dependencies: Vec<String>,
}

pub fn inspect_project(root: &Path) -> ProjectInfo {
    let uv_version = uv_program().and_then(|uv| {
        let mut command = Command::new(uv);
        command.arg("--version");
        run_with_timeout(command, PROBE_TIMEOUT)
            .ok()
            .filter(|output| output.status.success())
            .map(|output| output.stdout.trim().to_string())
    });
    let venv = root.join(".venv");
    ProjectInfo {
        working_dir: root.to_path_buf(),
        uv_available: uv_version.is_some(),
        uv_version,
        venv: venv.is_dir().then_some(venv),
        uv_lock_exists: root.join("uv.lock").is_file(),
        pyproject_exists: root.join("pyproject.toml").is_file(),
        python_version: detect_python_version(root),
        dependencies: declared_dependencies(root),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupChecks {
    pub uv_installed: bool,
    pub venv_exists: bool,
    pub interpreter_runs: bool,
    pub uv_lock_exists: bool,
    pub pyproject_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupValidation {
    pub checks: SetupChecks,
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

pub fn validate_setup(root: &Path) -> SetupValidation {
    let venv = root.join(".venv");
    let python = venv_python(&venv);
    let checks = SetupChecks {
        uv_installed: uv_program().is_some(),
        venv_exists: python.is_some(),
        interpreter_runs: python
            .as_deref()
            .is_some_and(|python| interpreter_version(python).is_some()),
        uv_lock_exists: root.join("uv.lock").is_file(),
        pyproject_exists: root.join("pyproject.toml").is_file(),
    };
    summarize_checks(checks)
}

fn summarize_checks(checks: SetupChecks) -> SetupValidation {
    let mut issues = Vec::new();
    let mut suggestions = Vec::new();
    if !checks.uv_installed {
        issues.push("uv is not installed".to_string());
        suggestions.push(UV_INSTALL_HINT.to_string());
    }
    if !checks.venv_exists {
        issues.push("No virtual environment found".to_string());
        suggestions.push("Create one with jupyter_setup_environment (uv venv)".to_string());
    } else if !checks.interpreter_runs {
        issues.push("The .venv interpreter does not run".to_string());
        suggestions.push("Recreate the environment: rm -rf .venv && uv venv".to_string());
    }
    if checks.pyproject_exists && !checks.uv_lock_exists {
        issues.push("No uv.lock file found".to_string());
        suggestions.push("Create lock file: uv lock".to_string());
    }
    SetupValidation {
        is_valid: issues.is_empty(),
        checks,
        issues,
        suggestions,
    }
}

pub fn uv_program() -> Option<PathBuf> {
    if let Some(raw) = std::env::var_os(UV_PROGRAM_ENV).filter(|value| !value.is_empty()) {
        let path = PathBuf::from(raw);
        return path.is_file().then_some(path);
    }
    find_program_on_path(std::env::var_os("PATH").as_ref(), "uv")
}

pub(crate) fn venv_python(venv: &Path) -> Option<PathBuf> {
    [
        venv.join("bin").join("python"),
        venv.join("bin").join("python3"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

fn created_by_uv(venv: &Path) -> bool {
    pyvenv_cfg_value(venv, &["uv"]).is_some()
}

fn pyvenv_cfg_value(venv: &Path, keys: &[&str]) -> Option<String> {
    let text = fs::read_to_string(venv.join("pyvenv.cfg")).ok()?;
    for key in keys {
        for line in text.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            if name.trim() == *key && !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn parse_conda_env_list(stdout: &str) -> Vec<PathBuf> {
    serde_json::from_str::<serde_json::Value>(stdout)
        .ok()
        .and_then(|value| {
            value.get("envs").and_then(|envs| envs.as_array()).map(|envs| {
                envs.iter()
                    .filter_map(|env| env.as_str().map(PathBuf::from))
                    .collect()
            })
        })
        .unwrap_or_default()
}

/// `Python 3.12.1` on stdout (or stderr for very old interpreters) becomes `3.12.1`.
pub fn interpreter_version(python: &Path) -> Option<String> {
    let mut command = Command::new(python);
    command.arg("--version");
    let output = run_with_timeout(command, PROBE_TIMEOUT).ok()?;
    if !output.status.success() {
        return None;
    }
    let text = if output.stdout.trim().is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    text.split_whitespace().last().map(str::to_string)
}

pub(crate) fn find_program_on_path(path_var: Option<&OsString>, name: &str) -> Option<PathBuf> {
    let path = path_var?;
    for dir in std::env::split_paths(path) {
        let candidate = dir.join(name);
        if !candidate.is_file() {
            continue;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&candidate)
                && meta.permissions().mode() & 0o111 != 0
            {
                return Some(candidate);
            }
        }

        #[cfg(not(unix))]
        {
            return Some(candidate);
        }
    }
    None
}

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external tool with stdin closed and both output streams captured,
/// killing it when `timeout` elapses.
pub(crate) fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<CommandOutput, EnvironmentError> {
    let label = describe_command(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            EnvironmentError::ToolNotInstalled {
                tool: command.get_program().to_string_lossy().into_owned(),
            }
        } else {
            EnvironmentError::Io(err)
        }
    })?;
    let stdout = spawn_capture(child.stdout.take());
    let stderr = spawn_capture(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            event_log::log(
                "command_timeout",
                json!({ "command": label, "timeout_ms": timeout.as_millis() }),
            );
            // Grandchildren may still hold the pipes open, so the capture threads are abandoned.
            return Err(EnvironmentError::CommandTimeout {
                command: label,
                timeout,
            });
        }
        thread::sleep(Duration::from_millis(20));
    };

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn spawn_capture<R>(stream: Option<R>) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

pub(crate) fn describe_command(command: &Command) -> String {
    let program = Path::new(command.get_program())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::iter::once(program)
        .chain(
            command
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned()),
        )
        .collect::<Vec<_>>()
        .join(" ")
}
