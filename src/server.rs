use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, ErrorData as McpError, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod response;
mod timeouts;

use self::response::{
    execution_result, execution_result_with, failure, failure_payload, failure_with,
    invalid_request, json_text, ok_payload, success,
};
use self::timeouts::{INSPECT_TIMEOUT, parse_timeout};

use crate::config::KernelConfig;
use crate::environment::{self, EnvironmentDescriptor};
use crate::error::{FailureCategory, KernelError};
use crate::event_log;
use crate::guidance::{self, ErrorContext, GuidanceTopic};
use crate::inspect::{self, ProfileSort};
use crate::installer::{self, UvPackageManager};
use crate::kernel::{KernelStatus, KernelSupervisor, StartReport, StartStatus};
use crate::kernel_protocol::ExecutionResult;
use crate::notebook::{self, CellType, CellWrite, Template};
use crate::notebook_runner::{self, RunOptions};

#[derive(Clone)]
struct SharedServer {
    kernel: Arc<Mutex<KernelSupervisor>>,
    status: Arc<Mutex<KernelStatus>>,
    execution_timeout: Duration,
}

impl SharedServer {
    fn new(config: KernelConfig) -> Self {
        let execution_timeout = config.execution_timeout;
        let kernel = KernelSupervisor::new(config);
        let status = kernel.status_handle();
        Self {
            kernel: Arc::new(Mutex::new(kernel)),
            status,
            execution_timeout,
        }
    }

    fn kernel(&self) -> Arc<Mutex<KernelSupervisor>> {
        Arc::clone(&self.kernel)
    }

    fn working_dir(&self) -> PathBuf {
        self.status.lock().unwrap().working_dir.clone()
    }

    fn active_session(&self) -> Option<String> {
        self.status.lock().unwrap().session_id.clone()
    }

    /// Relative paths are taken against the kernel's working directory.
    fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.working_dir().join(path)
        }
    }

    fn resolve_dir(&self, raw: Option<&str>) -> Result<PathBuf, CallToolResult> {
        let dir = match raw {
            Some(raw) if !raw.trim().is_empty() => self.resolve_path(raw.trim()),
            _ => self.working_dir(),
        };
        if !dir.is_dir() {
            return Err(invalid_request(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
        Ok(dir.canonicalize().unwrap_or(dir))
    }

    async fn run_kernel<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&mut KernelSupervisor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let kernel = self.kernel.clone();
        tokio::task::spawn_blocking(move || {
            let mut kernel = kernel.lock().unwrap();
            f(&mut kernel)
        })
        .await
        .map_err(|err| McpError::internal_error(err.to_string(), None))
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| McpError::internal_error(err.to_string(), None))
    }

    async fn initialize(&self, args: InitializeArgs) -> Result<CallToolResult, McpError> {
        let dir = match self.resolve_dir(args.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(result) => return Ok(result),
        };
        let python_version = args.python_version;
        let report = self
            .run_kernel(move |kernel| initialize_session(kernel, dir, python_version))
            .await?;
        let mut payload = serde_json::to_value(&report)
            .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
        if report.ready {
            payload["status"] = json!("ok");
            Ok(CallToolResult::success(vec![json_text(&payload)]))
        } else {
            payload["status"] = json!("error");
            payload["category"] = json!(FailureCategory::StartupFailure);
            Ok(CallToolResult::error(vec![json_text(&payload)]))
        }
    }

    async fn execute_cell(&self, args: ExecuteCellArgs) -> Result<CallToolResult, McpError> {
        if args.code.trim().is_empty() {
            return Err(McpError::invalid_params("code must not be empty", None));
        }
        let timeout = parse_timeout(args.timeout, self.execution_timeout, "jupyter_execute_cell")?;
        self.execute_source(args.code, timeout, args.session_id)
            .await
    }

    async fn run_file(&self, args: RunFileArgs) -> Result<CallToolResult, McpError> {
        let timeout = parse_timeout(args.timeout, self.execution_timeout, "jupyter_run_file")?;
        let path = self.resolve_path(&args.file_path);
        if path.extension().is_none_or(|ext| ext != "py") {
            return Ok(invalid_request(format!(
                "{} is not a .py file",
                path.display()
            )));
        }
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                return Ok(invalid_request(format!(
                    "cannot read {}: {err}",
                    path.display()
                )));
            }
        };
        if source.trim().is_empty() {
            return Ok(invalid_request(format!("{} is empty", path.display())));
        }
        self.execute_source(source, timeout, args.session_id).await
    }

    async fn execute_source(
        &self,
        source: String,
        timeout: Duration,
        requested_session: Option<String>,
    ) -> Result<CallToolResult, McpError> {
        let (outcome, session_id) = self
            .run_kernel(move |kernel| {
                let outcome = kernel.execute_code(&source, timeout);
                (outcome, kernel.session_id().map(str::to_string))
            })
            .await?;
        let warnings = session_warnings(requested_session.as_deref(), session_id.as_deref());
        Ok(match outcome {
            Ok(result) => execution_result(&result, session_id.as_deref(), warnings),
            Err(err) => failure_with(&err, warnings),
        })
    }

    async fn execute_notebook(
        &self,
        args: ExecuteNotebookArgs,
    ) -> Result<CallToolResult, McpError> {
        let timeout = parse_timeout(
            args.timeout,
            self.execution_timeout,
            "jupyter_execute_notebook",
        )?;
        let path = self.resolve_path(&args.notebook_path);
        let options = RunOptions {
            timeout,
            stop_on_error: args.stop_on_error,
            save: args.save,
        };
        let outcome = self
            .run_kernel(move |kernel| {
                notebook_runner::execute_notebook(kernel, &path, options, |_| {})
            })
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        let run = match outcome {
            Ok(run) => run,
            Err(err) => return Ok(failure_with(&err, warnings)),
        };
        let control_failure = run.cells.iter().any(|cell| cell.result.failure.is_some());
        let mut payload = ok_payload(&run, warnings);
        if !run.success() {
            payload["status"] = json!("error");
        }
        let contents = vec![json_text(&payload)];
        Ok(if control_failure {
            CallToolResult::error(contents)
        } else {
            CallToolResult::success(contents)
        })
    }

    async fn inspect_namespace(
        &self,
        args: InspectNamespaceArgs,
    ) -> Result<CallToolResult, McpError> {
        let filter = args.filter_pattern;
        let outcome = self
            .run_kernel(move |kernel| kernel.inspect_state(filter.as_deref(), INSPECT_TIMEOUT))
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        Ok(match outcome {
            Ok(report) => {
                let mut payload = ok_payload(&report, warnings);
                payload["count"] = json!(report.variables.len());
                success(&payload)
            }
            Err(err) => failure_with(&err, warnings),
        })
    }

    async fn inspect_variable(
        &self,
        args: InspectVariableArgs,
    ) -> Result<CallToolResult, McpError> {
        let name = args.variable_name;
        let outcome = self
            .run_kernel(move |kernel| kernel.inspect_variable(name.trim(), INSPECT_TIMEOUT))
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        Ok(match outcome {
            Ok(detail) => success(&ok_payload(&detail, warnings)),
            Err(err) => failure_with(&err, warnings),
        })
    }

    async fn list_variables(&self, args: ListVariablesArgs) -> Result<CallToolResult, McpError> {
        let outcome = self
            .run_kernel(|kernel| kernel.inspect_state(None, INSPECT_TIMEOUT))
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        let mut report = match outcome {
            Ok(report) => report,
            Err(err) => return Ok(failure_with(&err, warnings)),
        };
        let var_type = args.var_type.filter(|var_type| !var_type.trim().is_empty());
        if let Some(var_type) = var_type.as_deref() {
            report.variables = inspect::filter_by_type(report.variables, var_type);
        }
        let mut payload = ok_payload(&report, warnings);
        payload["total_variables"] = json!(report.variables.len());
        if let Some(var_type) = var_type {
            payload["filter"] = json!({ "type": var_type });
        }
        if report.variables.is_empty() {
            payload["hint"] = json!("no matching variables; run some code first");
        }
        Ok(success(&payload))
    }

    async fn profile_code(&self, args: ProfileCodeArgs) -> Result<CallToolResult, McpError> {
        if args.code.trim().is_empty() {
            return Err(McpError::invalid_params("code must not be empty", None));
        }
        let sort_by = ProfileSort::parse(args.sort_by.as_deref().unwrap_or("cumulative"))
            .map_err(|err| McpError::invalid_params(err.to_string(), None))?;
        let timeout = parse_timeout(args.timeout, self.execution_timeout, "jupyter_profile_code")?;
        let code = args.code;
        let (outcome, session_id) = self
            .run_kernel(move |kernel| {
                let outcome = kernel.profile_code(&code, sort_by, timeout);
                (outcome, kernel.session_id().map(str::to_string))
            })
            .await?;
        let warnings = session_warnings(args.session_id.as_deref(), session_id.as_deref());
        let run = match outcome {
            Ok(run) => run,
            Err(err) => return Ok(failure_with(&err, warnings)),
        };
        let mut extra = Map::new();
        extra.insert("sort_by".to_string(), json!(run.sort_by));
        extra.insert("profile".to_string(), json!(run.profile));
        Ok(execution_result_with(
            &run.execution,
            session_id.as_deref(),
            warnings,
            extra,
        ))
    }

    async fn get_guidance(&self, args: GuidanceArgs) -> Result<CallToolResult, McpError> {
        let topic = GuidanceTopic::parse(&args.action);
        let context = ErrorContext {
            error_type: args.error_type,
            module: args.module,
        };
        let guidance = guidance::guidance(topic, &context);
        Ok(success(&ok_payload(&guidance, Vec::new())))
    }

    /// Looks at the namespace only when a kernel is already running; never
    /// starts one.
    async fn what_next(&self, args: WhatNextArgs) -> Result<CallToolResult, McpError> {
        let goal = args.goal.filter(|goal| !goal.trim().is_empty());
        let next = self
            .run_kernel(move |kernel| {
                let status = kernel.status();
                let last_error = kernel.last_error();
                let variables = if status.running {
                    kernel
                        .inspect_state(None, INSPECT_TIMEOUT)
                        .map(|report| report.variables)
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                guidance::what_next(&status, &variables, last_error.as_ref(), goal)
            })
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        Ok(success(&ok_payload(&next, warnings)))
    }

    async fn debug_last_error(&self, args: SessionArgs) -> Result<CallToolResult, McpError> {
        let report = self.run_kernel(|kernel| kernel.last_error()).await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        Ok(match report {
            Some(report) => success(&ok_payload(&report, warnings)),
            None => {
                let mut payload = ok_payload(&json!({ "has_error": false }), warnings);
                payload["message"] = json!("no exception has been recorded in this server");
                success(&payload)
            }
        })
    }

    async fn ensure_dependencies(
        &self,
        args: EnsureDependenciesArgs,
    ) -> Result<CallToolResult, McpError> {
        let EnsureDependenciesArgs {
            session_id,
            packages,
            dev,
        } = args;
        let outcome = self
            .run_kernel(move |kernel| {
                let root = kernel.config().working_dir.clone();
                let environment = target_environment(kernel)?;
                installer::ensure(
                    &UvPackageManager::from_env(),
                    &environment,
                    &root,
                    &packages,
                    dev,
                )
            })
            .await?;
        let warnings = self.warnings_for(session_id.as_deref());
        Ok(match outcome {
            Ok(report) => {
                let mut payload = ok_payload(&report, warnings);
                if report.success {
                    success(&payload)
                } else {
                    payload["status"] = json!("error");
                    payload["category"] = json!(FailureCategory::DependencyFailure);
                    payload["failed_count"] = json!(report.failed_count());
                    CallToolResult::error(vec![json_text(&payload)])
                }
            }
            Err(err) => failure_with(&err, warnings),
        })
    }

    async fn sync_environment(&self, args: SyncEnvironmentArgs) -> Result<CallToolResult, McpError> {
        let upgrade = args.upgrade;
        let outcome = self
            .run_kernel(move |kernel| {
                let root = kernel.config().working_dir.clone();
                let environment = target_environment(kernel)?;
                installer::sync(&UvPackageManager::from_env(), &environment, &root, upgrade)
            })
            .await?;
        let warnings = self.warnings_for(args.session_id.as_deref());
        Ok(match outcome {
            Ok(report) => success(&ok_payload(&report, warnings)),
            Err(err) => failure_with(&err, warnings),
        })
    }

    async fn detect_environment(
        &self,
        args: WorkingDirArgs,
    ) -> Result<CallToolResult, McpError> {
        let dir = match self.resolve_dir(args.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(result) => return Ok(result),
        };
        let payload = self
            .run_blocking(move || {
                let environments = environment::detect_environments(&dir);
                let project = environment::inspect_project(&dir);
                json!({
                    "status": "ok",
                    "working_dir": dir,
                    "recommended": environments.first(),
                    "environments": environments,
                    "project": project,
                })
            })
            .await?;
        Ok(success(&payload))
    }

    async fn setup_environment(
        &self,
        args: SetupEnvironmentArgs,
    ) -> Result<CallToolResult, McpError> {
        let dir = match self.resolve_dir(args.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(result) => return Ok(result),
        };
        let python_version = args.python_version;
        let outcome = self
            .run_blocking(move || {
                environment::create_managed_environment(&dir, python_version.as_deref())
            })
            .await?;
        Ok(match outcome {
            Ok(environment) => {
                let mut payload = ok_payload(&json!({ "environment": environment }), Vec::new());
                payload["next_steps"] = json!([
                    "Call jupyter_restart_kernel (or jupyter_initialize) so the kernel uses the new environment",
                ]);
                success(&payload)
            }
            Err(err) => failure(&err),
        })
    }

    async fn validate_setup(&self, args: WorkingDirArgs) -> Result<CallToolResult, McpError> {
        let dir = match self.resolve_dir(args.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(result) => return Ok(result),
        };
        let validation = self
            .run_blocking(move || environment::validate_setup(&dir))
            .await?;
        Ok(success(&ok_payload(&validation, Vec::new())))
    }

    /// Never waits behind a running execution: falls back to the published
    /// snapshot when the supervisor is busy.
    async fn kernel_status(&self, args: SessionArgs) -> Result<CallToolResult, McpError> {
        let (status, busy) = match self.kernel.try_lock() {
            Ok(mut kernel) => (kernel.status(), false),
            Err(_) => (self.status.lock().unwrap().clone(), true),
        };
        let warnings = session_warnings(args.session_id.as_deref(), status.session_id.as_deref());
        let mut payload = ok_payload(&status, warnings);
        payload["busy"] = json!(busy);
        Ok(success(&payload))
    }

    async fn restart_kernel(&self, args: SessionArgs) -> Result<CallToolResult, McpError> {
        let warnings = self.warnings_for(args.session_id.as_deref());
        let outcome = self.run_kernel(|kernel| kernel.restart()).await?;
        Ok(start_result(outcome, warnings))
    }

    async fn shutdown_kernel(&self, args: SessionArgs) -> Result<CallToolResult, McpError> {
        let warnings = self.warnings_for(args.session_id.as_deref());
        let status = self.run_kernel(|kernel| kernel.shutdown()).await?;
        let mut payload = ok_payload(&json!({ "shutdown": status }), warnings);
        payload["running"] = json!(false);
        Ok(success(&payload))
    }

    async fn create_notebook(&self, args: CreateNotebookArgs) -> Result<CallToolResult, McpError> {
        let path = self.resolve_path(&args.filename);
        let template = args.template;
        let title = args.title;
        let outcome = self
            .run_blocking(move || {
                let template = Template::parse(template.as_deref().unwrap_or("default"))?;
                notebook::create(&path, template, title.as_deref())
            })
            .await?;
        Ok(match outcome {
            Ok(summary) => success(&ok_payload(&summary, Vec::new())),
            Err(err) => failure(&err),
        })
    }

    async fn add_cell(&self, args: AddCellArgs) -> Result<CallToolResult, McpError> {
        let cell_type = match CellType::parse(&args.cell_type) {
            Ok(cell_type) => cell_type,
            Err(err) => return Ok(failure(&err)),
        };
        let timeout = parse_timeout(args.timeout, self.execution_timeout, "jupyter_add_cell")?;
        let path = self.resolve_path(&args.notebook_path);
        let mut warnings = self.warnings_for(args.session_id.as_deref());
        if args.execute && cell_type != CellType::Code {
            warnings.push("execute ignored for a markdown cell".to_string());
        }
        let execute = args.execute && cell_type == CellType::Code && !args.content.trim().is_empty();
        let content = args.content;
        let position = args.position;

        let outcome = self
            .run_kernel(move |kernel| {
                let result = if execute {
                    Some(kernel.execute_code(&content, timeout)?)
                } else {
                    None
                };
                let write = match position {
                    Some(position) => {
                        notebook::insert_cell(&path, position, cell_type, &content, result.as_ref())
                    }
                    None => notebook::append_cell(&path, cell_type, &content, result.as_ref()),
                };
                Ok::<_, CellEditError>((write?, result))
            })
            .await?;
        Ok(cell_edit_result(outcome, warnings))
    }

    async fn update_cell(&self, args: UpdateCellArgs) -> Result<CallToolResult, McpError> {
        let timeout = parse_timeout(args.timeout, self.execution_timeout, "jupyter_update_cell")?;
        let path = self.resolve_path(&args.notebook_path);
        let mut warnings = self.warnings_for(args.session_id.as_deref());
        let index = args.cell_index;
        let content = args.content;
        let execute = args.execute;

        let outcome = self
            .run_kernel(move |kernel| {
                let document = notebook::read(&path)?;
                let cell_type = document.cells.get(index).map(|cell| cell.cell_type);
                let result = if execute
                    && cell_type == Some(CellType::Code)
                    && !content.trim().is_empty()
                {
                    Some(kernel.execute_code(&content, timeout)?)
                } else {
                    None
                };
                let write = notebook::update_cell(&path, index, &content, result.as_ref())?;
                Ok::<_, CellEditError>((write, result, cell_type))
            })
            .await?;
        let outcome = outcome.map(|(write, result, cell_type)| {
            if execute && cell_type.is_some_and(|cell_type| cell_type != CellType::Code) {
                warnings.push("execute ignored for a non-code cell".to_string());
            }
            (write, result)
        });
        Ok(cell_edit_result(outcome, warnings))
    }

    async fn get_notebook_info(&self, args: NotebookInfoArgs) -> Result<CallToolResult, McpError> {
        let path = self.resolve_path(&args.notebook_path);
        let outcome = self.run_blocking(move || notebook::describe(&path)).await?;
        Ok(match outcome {
            Ok(summary) => success(&ok_payload(&summary, Vec::new())),
            Err(err) => failure(&err),
        })
    }

    fn warnings_for(&self, requested: Option<&str>) -> Vec<String> {
        session_warnings(requested, self.active_session().as_deref())
    }
}

/// A `session_id` that does not name the active session is only reported.
fn session_warnings(requested: Option<&str>, active: Option<&str>) -> Vec<String> {
    let Some(requested) = requested.map(str::trim).filter(|id| !id.is_empty()) else {
        return Vec::new();
    };
    match active {
        Some(active) if active == requested => Vec::new(),
        Some(active) => vec![format!(
            "session_id {requested:?} does not match the active session {active:?}; the request used the active session"
        )],
        None => vec![format!(
            "session_id {requested:?} does not match any running session"
        )],
    }
}

/// Environment of the running kernel, or the one a new kernel would use.
fn target_environment(
    kernel: &KernelSupervisor,
) -> Result<EnvironmentDescriptor, installer::InstallerError> {
    if let Some(environment) = kernel.environment() {
        return Ok(environment.clone());
    }
    let config = kernel.config();
    let resolved =
        environment::resolve_interpreter(&config.working_dir, config.python_override.as_deref())?;
    Ok(resolved.environment)
}

#[derive(Debug, Serialize)]
struct InitializeReport {
    working_dir: PathBuf,
    steps: Vec<String>,
    warnings: Vec<String>,
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remediation: Vec<String>,
    session_id: Option<String>,
    ready: bool,
    environment: Option<EnvironmentDescriptor>,
    kernel: Option<StartReport>,
}

fn initialize_session(
    kernel: &mut KernelSupervisor,
    dir: PathBuf,
    python_version: Option<String>,
) -> InitializeReport {
    let mut report = InitializeReport {
        working_dir: dir.clone(),
        steps: Vec::new(),
        warnings: Vec::new(),
        errors: Vec::new(),
        remediation: Vec::new(),
        session_id: None,
        ready: false,
        environment: None,
        kernel: None,
    };
    let dir_changed = kernel.config().working_dir != dir;
    if dir_changed {
        kernel.set_working_dir(dir.clone());
    }
    report
        .steps
        .push(format!("working directory: {}", dir.display()));

    let python_override = kernel.config().python_override.clone();
    let environments = environment::detect_environments(&dir);
    report
        .steps
        .push(format!("found {} environment(s)", environments.len()));
    let mut created = false;
    match (&python_override, environments.iter().find(|env| env.is_isolated())) {
        (Some(python), _) => report
            .steps
            .push(format!("using interpreter override {}", python.display())),
        (None, Some(existing)) => report
            .steps
            .push(format!("using existing environment: {}", existing.describe())),
        (None, None) if environment::uv_program().is_some() => {
            match environment::create_managed_environment(&dir, python_version.as_deref()) {
                Ok(env) => {
                    created = true;
                    report
                        .steps
                        .push(format!("created managed environment at {}", env.root.display()));
                }
                Err(err) => {
                    report
                        .warnings
                        .push(format!("could not create a managed environment: {err}"));
                    report.remediation.extend(err.remediation());
                }
            }
        }
        (None, None) => report.warnings.push(
            "uv is not installed; no isolated environment could be created".to_string(),
        ),
    }

    if dir.join("uv.lock").is_file() && dir.join("pyproject.toml").is_file() {
        sync_lockfile(&dir, python_override.as_deref(), &mut report);
    }

    let outcome = if dir_changed || created {
        kernel.restart()
    } else {
        kernel.start()
    };
    match outcome {
        Ok(start) => {
            report.steps.push(format!(
                "kernel {} (pid {}, python {})",
                match start.status {
                    StartStatus::Started => "started",
                    StartStatus::AlreadyRunning => "already running",
                },
                start.pid,
                start.python_version
            ));
            report.warnings.extend(start.warnings.iter().cloned());
            report.session_id = Some(start.session_id.clone());
            report.environment = Some(start.environment.clone());
            report.kernel = Some(start);
        }
        Err(err) => {
            report.errors.push(format!("failed to start kernel: {err}"));
            report.remediation.extend(err.remediation());
        }
    }
    report.ready = report.errors.is_empty() && report.kernel.is_some();
    report
}

fn sync_lockfile(dir: &Path, python_override: Option<&Path>, report: &mut InitializeReport) {
    let environment = match environment::resolve_interpreter(dir, python_override) {
        Ok(resolved) => resolved.environment,
        Err(err) => {
            report
                .warnings
                .push(format!("skipped uv.lock sync: {err}"));
            return;
        }
    };
    match installer::sync(&UvPackageManager::from_env(), &environment, dir, false) {
        Ok(sync) => report.steps.push(format!(
            "synced dependencies from uv.lock ({} added, {} removed, {} changed)",
            sync.added.len(),
            sync.removed.len(),
            sync.changed.len()
        )),
        Err(err) => report
            .warnings
            .push(format!("could not sync uv.lock: {err}")),
    }
}

fn start_result(outcome: Result<StartReport, KernelError>, warnings: Vec<String>) -> CallToolResult {
    match outcome {
        Ok(report) => success(&ok_payload(&report, warnings)),
        Err(err) => failure_with(&err, warnings),
    }
}

#[derive(Debug, thiserror::Error)]
enum CellEditError {
    #[error(transparent)]
    Document(#[from] notebook::DocumentError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

fn cell_edit_result(
    outcome: Result<(CellWrite, Option<ExecutionResult>), CellEditError>,
    warnings: Vec<String>,
) -> CallToolResult {
    let (write, result) = match outcome {
        Ok(outcome) => outcome,
        Err(CellEditError::Document(err)) => return failure_with(&err, warnings),
        Err(CellEditError::Kernel(err)) => return failure_with(&err, warnings),
    };
    let mut payload = ok_payload(&write, warnings);
    let Some(result) = result else {
        return success(&payload);
    };
    payload["execution"] =
        serde_json::to_value(&result).unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
    match result.failure.as_ref() {
        Some(failure) => {
            let mut failed = failure_payload(
                failure.category,
                failure.message.clone(),
                result.remediation.clone().unwrap_or_default(),
            );
            failed["cell"] = payload;
            CallToolResult::error(vec![json_text(&failed)])
        }
        None => success(&payload),
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        instructions: Some(
            "Call jupyter_initialize first. Code runs in one persistent Python kernel; \
             variables survive between jupyter_execute_cell calls until the kernel restarts."
                .to_string(),
        ),
        ..ServerInfo::default()
    }
}

fn log_tool_begin<A: Serialize>(tool: &str, args: &A) {
    event_log::log_lazy("tool_call_begin", || {
        let args = serde_json::to_value(args)
            .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
        json!({
            "tool": tool,
            "args": args,
        })
    });
}

fn log_tool_end(
    tool: &str,
    result: Result<CallToolResult, McpError>,
) -> Result<CallToolResult, McpError> {
    match &result {
        Ok(result) => {
            event_log::log_lazy("tool_call_end", || {
                let serialized = serde_json::to_value(result)
                    .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
                json!({
                    "tool": tool,
                    "is_error": result.is_error,
                    "result": serialized,
                })
            });
        }
        Err(err) => {
            event_log::log_lazy("tool_call_error", || {
                json!({
                    "tool": tool,
                    "error": err.to_string(),
                })
            });
        }
    }
    result
}

#[derive(Clone)]
struct JupyterServer {
    shared: SharedServer,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl JupyterServer {
    fn new(config: KernelConfig) -> Self {
        Self {
            shared: SharedServer::new(config),
            tool_router: Self::tool_router(),
        }
    }

    fn get_info(&self) -> ServerInfo {
        server_info()
    }

    /// Prepare a project for code execution and start the kernel. Call this first.
    /// Scans for Python environments, creates `.venv` with uv when none exists, syncs
    /// `uv.lock` when present, then starts the kernel in `working_dir`. Returns the
    /// `session_id` to pass to later calls.
    #[tool(name = "jupyter_initialize")]
    async fn jupyter_initialize(
        &self,
        params: Parameters<InitializeArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_initialize", &params.0);
        let result = self.shared.initialize(params.0).await;
        log_tool_end("jupyter_initialize", result)
    }

    /// Execute Python code in the persistent kernel. State persists across calls.
    /// A raised exception is returned as a normal result with `has_error: true`, the
    /// traceback, a classification and remediation hints. Timeouts (default 120 s) and
    /// kernel death are returned as errors carrying any output produced so far.
    #[tool(name = "jupyter_execute_cell")]
    async fn jupyter_execute_cell(
        &self,
        params: Parameters<ExecuteCellArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_execute_cell", &params.0);
        let result = self.shared.execute_cell(params.0).await;
        log_tool_end("jupyter_execute_cell", result)
    }

    /// Execute the contents of a `.py` file in the kernel, as if pasted into a cell.
    #[tool(name = "jupyter_run_file")]
    async fn jupyter_run_file(
        &self,
        params: Parameters<RunFileArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_run_file", &params.0);
        let result = self.shared.run_file(params.0).await;
        log_tool_end("jupyter_run_file", result)
    }

    /// Run every code cell of a notebook in order in the kernel. Stops at the first
    /// exception unless `stop_on_error` is false; `save` writes outputs back.
    #[tool(name = "jupyter_execute_notebook")]
    async fn jupyter_execute_notebook(
        &self,
        params: Parameters<ExecuteNotebookArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_execute_notebook", &params.0);
        let result = self.shared.execute_notebook(params.0).await;
        log_tool_end("jupyter_execute_notebook", result)
    }

    /// List the kernel's user variables with type, shape and a short repr.
    /// `filter_pattern` keeps names containing the given text.
    #[tool(name = "jupyter_inspect_namespace")]
    async fn jupyter_inspect_namespace(
        &self,
        params: Parameters<InspectNamespaceArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_inspect_namespace", &params.0);
        let result = self.shared.inspect_namespace(params.0).await;
        log_tool_end("jupyter_inspect_namespace", result)
    }

    /// Detailed view of one variable: type, module, repr, length, shape, dtype,
    /// columns, size and public attributes.
    #[tool(name = "jupyter_inspect_variable")]
    async fn jupyter_inspect_variable(
        &self,
        params: Parameters<InspectVariableArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_inspect_variable", &params.0);
        let result = self.shared.inspect_variable(params.0).await;
        log_tool_end("jupyter_inspect_variable", result)
    }

    /// List user variables with type, length and shape. `var_type` keeps only
    /// values of that type name (case-insensitive), e.g. "DataFrame" or "list".
    #[tool(name = "jupyter_list_variables")]
    async fn jupyter_list_variables(
        &self,
        params: Parameters<ListVariablesArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_list_variables", &params.0);
        let result = self.shared.list_variables(params.0).await;
        log_tool_end("jupyter_list_variables", result)
    }

    /// Run code in the kernel under cProfile and return the top 20 functions,
    /// sorted by `sort_by` (cumulative, time or calls). Variables the code
    /// defines persist like in jupyter_execute_cell.
    #[tool(name = "jupyter_profile_code")]
    async fn jupyter_profile_code(
        &self,
        params: Parameters<ProfileCodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_profile_code", &params.0);
        let result = self.shared.profile_code(params.0).await;
        log_tool_end("jupyter_profile_code", result)
    }

    /// Step-by-step tool guidance for an action: setup_environment, fix_error,
    /// create_notebook, execute_code, install_package or manage_kernel.
    #[tool(name = "jupyter_get_guidance")]
    async fn jupyter_get_guidance(
        &self,
        params: Parameters<GuidanceArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_get_guidance", &params.0);
        let result = self.shared.get_guidance(params.0).await;
        log_tool_end("jupyter_get_guidance", result)
    }

    /// Suggest next actions from the kernel state, its variables and the last
    /// exception.
    #[tool(name = "jupyter_what_next")]
    async fn jupyter_what_next(
        &self,
        params: Parameters<WhatNextArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_what_next", &params.0);
        let result = self.shared.what_next(params.0).await;
        log_tool_end("jupyter_what_next", result)
    }

    /// Classify the most recent exception and suggest what to do next.
    #[tool(name = "jupyter_debug_last_error")]
    async fn jupyter_debug_last_error(
        &self,
        params: Parameters<SessionArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_debug_last_error", &params.0);
        let result = self.shared.debug_last_error(params.0).await;
        log_tool_end("jupyter_debug_last_error", result)
    }

    /// Install missing packages with uv (`uv add`, or `uv pip install` outside a uv
    /// project). Packages already present at a version the requirement allows
    /// are reported as `already_present` and nothing is installed for them.
    #[tool(name = "jupyter_ensure_dependencies")]
    async fn jupyter_ensure_dependencies(
        &self,
        params: Parameters<EnsureDependenciesArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_ensure_dependencies", &params.0);
        let result = self.shared.ensure_dependencies(params.0).await;
        log_tool_end("jupyter_ensure_dependencies", result)
    }

    /// Run `uv sync` and report added, removed and changed packages.
    #[tool(name = "jupyter_sync_environment")]
    async fn jupyter_sync_environment(
        &self,
        params: Parameters<SyncEnvironmentArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_sync_environment", &params.0);
        let result = self.shared.sync_environment(params.0).await;
        log_tool_end("jupyter_sync_environment", result)
    }

    /// List the Python environments available to a project, best first, plus
    /// project metadata (uv, pyproject.toml, uv.lock, requested Python version).
    #[tool(name = "jupyter_detect_environment")]
    async fn jupyter_detect_environment(
        &self,
        params: Parameters<WorkingDirArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_detect_environment", &params.0);
        let result = self.shared.detect_environment(params.0).await;
        log_tool_end("jupyter_detect_environment", result)
    }

    /// Create a uv-managed `.venv` in the project.
    #[tool(name = "jupyter_setup_environment")]
    async fn jupyter_setup_environment(
        &self,
        params: Parameters<SetupEnvironmentArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_setup_environment", &params.0);
        let result = self.shared.setup_environment(params.0).await;
        log_tool_end("jupyter_setup_environment", result)
    }

    /// Check that uv, the project environment and its interpreter are usable.
    #[tool(name = "jupyter_validate_setup")]
    async fn jupyter_validate_setup(
        &self,
        params: Parameters<WorkingDirArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_validate_setup", &params.0);
        let result = self.shared.validate_setup(params.0).await;
        log_tool_end("jupyter_validate_setup", result)
    }

    /// Kernel state, pid, execution count and session id. Answers immediately even
    /// while code is running.
    #[tool(name = "jupyter_kernel_status")]
    async fn jupyter_kernel_status(
        &self,
        params: Parameters<SessionArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_kernel_status", &params.0);
        let result = self.shared.kernel_status(params.0).await;
        log_tool_end("jupyter_kernel_status", result)
    }

    /// Stop the kernel and start a fresh one. All variables are lost.
    #[tool(name = "jupyter_restart_kernel")]
    async fn jupyter_restart_kernel(
        &self,
        params: Parameters<SessionArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_restart_kernel", &params.0);
        let result = self.shared.restart_kernel(params.0).await;
        log_tool_end("jupyter_restart_kernel", result)
    }

    /// Stop the kernel. Calling it again reports `not_running`.
    #[tool(name = "jupyter_shutdown_kernel")]
    async fn jupyter_shutdown_kernel(
        &self,
        params: Parameters<SessionArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_shutdown_kernel", &params.0);
        let result = self.shared.shutdown_kernel(params.0).await;
        log_tool_end("jupyter_shutdown_kernel", result)
    }

    /// Create a notebook from a template: default, data_analysis, ml_experiment or
    /// visualization.
    #[tool(name = "jupyter_create_notebook")]
    async fn jupyter_create_notebook(
        &self,
        params: Parameters<CreateNotebookArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_create_notebook", &params.0);
        let result = self.shared.create_notebook(params.0).await;
        log_tool_end("jupyter_create_notebook", result)
    }

    /// Append (or insert at `position`) a code or markdown cell. With `execute`, a code
    /// cell is run first and its outputs are stored in the notebook.
    #[tool(name = "jupyter_add_cell")]
    async fn jupyter_add_cell(
        &self,
        params: Parameters<AddCellArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_add_cell", &params.0);
        let result = self.shared.add_cell(params.0).await;
        log_tool_end("jupyter_add_cell", result)
    }

    /// Replace the source of the cell at `cell_index` (0-based). Stored outputs are
    /// cleared, or replaced when `execute` is set.
    #[tool(name = "jupyter_update_cell")]
    async fn jupyter_update_cell(
        &self,
        params: Parameters<UpdateCellArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_update_cell", &params.0);
        let result = self.shared.update_cell(params.0).await;
        log_tool_end("jupyter_update_cell", result)
    }

    /// Cell count and a per-cell summary of a notebook.
    #[tool(name = "jupyter_get_notebook_info")]
    async fn jupyter_get_notebook_info(
        &self,
        params: Parameters<NotebookInfoArgs>,
    ) -> Result<CallToolResult, McpError> {
        log_tool_begin("jupyter_get_notebook_info", &params.0);
        let result = self.shared.get_notebook_info(params.0).await;
        log_tool_end("jupyter_get_notebook_info", result)
    }
}

#[tool_handler]
impl ServerHandler for JupyterServer {
    fn get_info(&self) -> ServerInfo {
        JupyterServer::get_info(self)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct SessionArgs {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct WorkingDirArgs {
    /// Project directory; defaults to the server's working directory.
    #[serde(default)]
    working_dir: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct InitializeArgs {
    /// Project directory; defaults to the server's working directory.
    #[serde(default)]
    working_dir: Option<String>,
    /// Python version for a newly created `.venv`, e.g. "3.12".
    #[serde(default)]
    python_version: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct ExecuteCellArgs {
    #[serde(default)]
    session_id: Option<String>,
    code: String,
    /// Seconds; defaults to 120.
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct RunFileArgs {
    #[serde(default)]
    session_id: Option<String>,
    file_path: String,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct ExecuteNotebookArgs {
    #[serde(default)]
    session_id: Option<String>,
    notebook_path: String,
    #[serde(default = "default_true")]
    stop_on_error: bool,
    #[serde(default)]
    save: bool,
    /// Per-cell timeout in seconds.
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct InspectNamespaceArgs {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    filter_pattern: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct InspectVariableArgs {
    #[serde(default)]
    session_id: Option<String>,
    variable_name: String,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct ListVariablesArgs {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    var_type: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct ProfileCodeArgs {
    #[serde(default)]
    session_id: Option<String>,
    code: String,
    /// "cumulative" (default), "time" or "calls".
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GuidanceArgs {
    action: String,
    /// Exception class name, used with "fix_error".
    #[serde(default)]
    error_type: Option<String>,
    /// Module that failed to import, used with "fix_error".
    #[serde(default)]
    module: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct WhatNextArgs {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    goal: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct EnsureDependenciesArgs {
    #[serde(default)]
    session_id: Option<String>,
    /// Requirement specifiers, e.g. "pandas" or "numpy>=1.26".
    packages: Vec<String>,
    /// Add as development dependencies.
    #[serde(default)]
    dev: bool,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct SyncEnvironmentArgs {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    upgrade: bool,
}

#[derive(Deserialize, Serialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct SetupEnvironmentArgs {
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    python_version: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct CreateNotebookArgs {
    /// Notebook path; `.ipynb` is added when missing.
    filename: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct AddCellArgs {
    notebook_path: String,
    /// "code" or "markdown".
    cell_type: String,
    content: String,
    /// Insert position (0-based); appends when omitted.
    #[serde(default)]
    position: Option<usize>,
    #[serde(default)]
    execute: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct UpdateCellArgs {
    notebook_path: String,
    cell_index: usize,
    content: String,
    #[serde(default)]
    execute: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct NotebookInfoArgs {
    notebook_path: String,
}

pub async fn run(config: KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("starting jupyter-mcp server");
    event_log::log(
        "server_run_begin",
        json!({
            "working_dir": config.working_dir.to_string_lossy(),
            "python_override": config.python_override.as_ref().map(|path| path.to_string_lossy().into_owned()),
        }),
    );
    let service = JupyterServer::new(config);
    let kernel = service.shared.kernel();

    event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    {
        let mut kernel = kernel.lock().unwrap();
        kernel.shutdown();
    }
    match &result {
        Ok(()) => event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
