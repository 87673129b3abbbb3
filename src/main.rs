mod classify;
mod config;
mod connection_file;
mod diagnostics;
mod environment;
mod error;
mod event_log;
mod guidance;
mod inspect;
mod installer;
mod ipc;
mod kernel;
mod kernel_process;
mod kernel_protocol;
mod normalize;
mod notebook;
mod notebook_runner;
mod server;

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use crate::config::KernelConfig;
use crate::kernel::KernelSupervisor;
use crate::notebook_runner::{CellRun, RunOptions};

enum CliCommand {
    RunServer(CliOptions),
    RunNotebook(RunNotebookOptions),
}

#[derive(Debug, Default)]
struct CliOptions {
    working_dir: Option<PathBuf>,
    python: Option<PathBuf>,
    debug_events_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct RunNotebookOptions {
    notebook: PathBuf,
    common: CliOptions,
    timeout: Option<Duration>,
    continue_on_error: bool,
    save: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // The kernel and the server both write to pipes the peer may close first.
    // Surface EPIPE as an error instead of dying on SIGPIPE.
    ignore_sigpipe();
    diagnostics::mark_startup_epoch();
    diagnostics::startup_log("main: entry");

    let args = std::env::args_os().skip(1).collect();
    let command = match parse_cli_args(args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("jupyter-mcp: {err}");
            eprintln!("run `jupyter-mcp --help` for usage");
            std::process::exit(2);
        }
    };

    match command {
        CliCommand::RunServer(options) => {
            let config = kernel_config(&options)?;
            event_log::initialize(
                options.debug_events_dir,
                event_log::StartupContext {
                    mode: "server".to_string(),
                    working_dir: config.working_dir.clone(),
                    python_override: config.python_override.clone(),
                },
            )?;
            diagnostics::startup_log("main: server mode");
            server::run(config).await
        }
        CliCommand::RunNotebook(options) => {
            let code = match notebook_config(&options) {
                Ok(config) => {
                    event_log::initialize(
                        options.common.debug_events_dir.clone(),
                        event_log::StartupContext {
                            mode: "run_notebook".to_string(),
                            working_dir: config.working_dir.clone(),
                            python_override: config.python_override.clone(),
                        },
                    )?;
                    diagnostics::startup_log("main: run-notebook mode");
                    tokio::task::spawn_blocking(move || run_notebook(config, &options)).await?
                }
                Err(err) => {
                    eprintln!("jupyter-mcp: {err}");
                    2
                }
            };
            std::process::exit(code);
        }
    }
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Environment settings with CLI flags applied on top.
fn kernel_config(options: &CliOptions) -> Result<KernelConfig, Box<dyn std::error::Error>> {
    let mut config = KernelConfig::from_env()?;
    if let Some(dir) = options.working_dir.as_ref() {
        config.working_dir = dir.clone();
    }
    if !config.working_dir.is_dir() {
        return Err(format!(
            "working directory does not exist: {}",
            config.working_dir.display()
        )
        .into());
    }
    config.working_dir = absolute(&config.working_dir);
    if let Some(python) = options.python.as_ref() {
        config.python_override = Some(python.clone());
    }
    Ok(config)
}

fn notebook_config(
    options: &RunNotebookOptions,
) -> Result<KernelConfig, Box<dyn std::error::Error>> {
    let mut config = kernel_config(&options.common)?;
    if let Some(timeout) = options.timeout {
        config.execution_timeout = timeout;
    }
    Ok(config)
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Exit code: 0 when every cell succeeded, 1 otherwise.
fn run_notebook(config: KernelConfig, options: &RunNotebookOptions) -> i32 {
    let path = if options.notebook.is_absolute() {
        options.notebook.clone()
    } else {
        config.working_dir.join(&options.notebook)
    };
    let run_options = RunOptions {
        timeout: config.execution_timeout,
        stop_on_error: !options.continue_on_error,
        save: options.save,
    };
    let mut kernel = KernelSupervisor::new(config);
    eprintln!("running {}", path.display());
    let outcome = notebook_runner::execute_notebook(&mut kernel, &path, run_options, report_cell);
    kernel.shutdown();

    match outcome {
        Ok(run) => {
            match serde_json::to_string_pretty(&run) {
                Ok(summary) => println!("{summary}"),
                Err(err) => eprintln!("failed to render summary: {err}"),
            }
            if let Some(index) = run.stopped_at {
                eprintln!("stopped after cell {index}");
            }
            eprintln!(
                "{} of {} code cells executed, {} failed{}",
                run.executed,
                run.code_cells,
                run.failed,
                if run.saved { ", outputs saved" } else { "" }
            );
            if run.success() { 0 } else { 1 }
        }
        Err(err) => {
            eprintln!("error: {err}");
            for hint in err.remediation() {
                eprintln!("  hint: {hint}");
            }
            println!(
                "{}",
                json!({
                    "status": "error",
                    "category": err.category(),
                    "message": err.to_string(),
                    "remediation": err.remediation(),
                })
            );
            1
        }
    }
}

fn report_cell(cell: &CellRun) {
    let count = cell.result.execution_count;
    if let Some(failure) = cell.result.failure.as_ref() {
        eprintln!(
            "[cell {}] [{count}] {}: {}",
            cell.index,
            failure.category.as_str(),
            failure.message
        );
    } else if let Some((ename, evalue, _)) = cell.result.first_error() {
        eprintln!("[cell {}] [{count}] {ename}: {evalue}", cell.index);
    } else {
        eprintln!("[cell {}] [{count}] ok", cell.index);
    }
}

/// Paths are kept as `OsString` end to end; only flag names must be UTF-8.
fn parse_cli_args(args: Vec<OsString>) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut parser = ArgParser { args, index: 0 };
    if parser.peek().is_some_and(|arg| arg == "run-notebook") {
        parser.next();
        return Ok(CliCommand::RunNotebook(parse_run_notebook_args(&mut parser)?));
    }

    let mut options = CliOptions::default();
    while let Some(arg) = parser.next() {
        if arg == "-h" || arg == "--help" {
            print_usage();
            std::process::exit(0);
        }
        if !parse_common_arg(&arg, &mut parser, &mut options)? {
            return Err(format!("unknown argument: {}", arg.to_string_lossy()).into());
        }
    }
    Ok(CliCommand::RunServer(options))
}

fn parse_run_notebook_args(
    parser: &mut ArgParser,
) -> Result<RunNotebookOptions, Box<dyn std::error::Error>> {
    let mut common = CliOptions::default();
    let mut notebook = None;
    let mut timeout = None;
    let mut continue_on_error = false;
    let mut save = false;
    while let Some(arg) = parser.next() {
        if parse_common_arg(&arg, parser, &mut common)? {
            continue;
        }
        let Some(text) = arg.to_str() else {
            set_notebook(&mut notebook, &arg)?;
            continue;
        };
        match text {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--continue-on-error" => continue_on_error = true,
            "--save" => save = true,
            "--timeout" => {
                let value = parser.next_value("--timeout")?;
                let value = value.to_string_lossy();
                timeout = Some(config::parse_secs(&value, "--timeout")?);
            }
            _ if text.starts_with("--timeout=") => {
                let value = flag_value(text, "--timeout")?;
                timeout = Some(config::parse_secs(value, "--timeout")?);
            }
            _ if text.starts_with('-') => {
                return Err(format!("unknown run-notebook option: {text}").into());
            }
            _ => set_notebook(&mut notebook, &arg)?,
        }
    }
    let notebook = notebook.ok_or("missing notebook path for run-notebook")?;
    Ok(RunNotebookOptions {
        notebook,
        common,
        timeout,
        continue_on_error,
        save,
    })
}

fn set_notebook(
    notebook: &mut Option<PathBuf>,
    arg: &OsStr,
) -> Result<(), Box<dyn std::error::Error>> {
    if notebook.is_some() {
        return Err(format!("unexpected extra argument: {}", arg.to_string_lossy()).into());
    }
    *notebook = Some(PathBuf::from(arg));
    Ok(())
}

/// Flags shared by the server and `run-notebook`. Returns false for anything else.
fn parse_common_arg(
    arg: &OsStr,
    parser: &mut ArgParser,
    options: &mut CliOptions,
) -> Result<bool, Box<dyn std::error::Error>> {
    let Some((flag, inline)) = split_flag(arg) else {
        return Ok(false);
    };
    let slot = match flag.as_str() {
        "--working-dir" => &mut options.working_dir,
        "--python" => &mut options.python,
        "--debug-events-dir" => &mut options.debug_events_dir,
        _ => return Ok(false),
    };
    let value = match inline {
        Some(value) => value,
        None => parser.next_value(&flag)?,
    };
    if value.to_string_lossy().trim().is_empty() {
        return Err(format!("missing value for {flag}").into());
    }
    *slot = Some(PathBuf::from(value));
    Ok(true)
}

/// Splits `--flag=value` without requiring the value to be UTF-8. `None` when
/// the flag name itself is not UTF-8.
fn split_flag(arg: &OsStr) -> Option<(String, Option<OsString>)> {
    if let Some(text) = arg.to_str() {
        return Some(match text.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => {
                (flag.to_string(), Some(OsString::from(value)))
            }
            _ => (text.to_string(), None),
        });
    }
    split_raw_flag(arg)
}

#[cfg(target_family = "unix")]
fn split_raw_flag(arg: &OsStr) -> Option<(String, Option<OsString>)> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = arg.as_bytes();
    let eq = bytes.iter().position(|byte| *byte == b'=')?;
    let flag = std::str::from_utf8(&bytes[..eq]).ok()?;
    flag.starts_with("--").then(|| {
        (
            flag.to_string(),
            Some(OsStr::from_bytes(&bytes[eq + 1..]).to_os_string()),
        )
    })
}

#[cfg(not(target_family = "unix"))]
fn split_raw_flag(_arg: &OsStr) -> Option<(String, Option<OsString>)> {
    None
}

fn flag_value<'a>(arg: &'a str, flag: &str) -> Result<&'a str, Box<dyn std::error::Error>> {
    let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
    if value.trim().is_empty() {
        return Err(format!("missing value for {flag}").into());
    }
    Ok(value)
}

struct ArgParser {
    args: Vec<OsString>,
    index: usize,
}

impl ArgParser {
    fn next(&mut self) -> Option<OsString> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn peek(&self) -> Option<&OsStr> {
        self.args.get(self.index).map(OsString::as_os_str)
    }

    fn next_value(&mut self, flag: &str) -> Result<OsString, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
jupyter-mcp [--working-dir <dir>] [--python <path>] [--debug-events-dir <dir>]\n\
jupyter-mcp run-notebook <path.ipynb> [--working-dir <dir>] [--python <path>] [--timeout <secs>] [--continue-on-error] [--save]\n\n\
--working-dir: project directory for the kernel (env: JUPYTER_MCP_WORKING_DIR; default: current directory)\n\
--python: interpreter to run instead of the detected environment (env: JUPYTER_MCP_PYTHON)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: JUPYTER_MCP_DEBUG_EVENTS_DIR)\n\
run-notebook: execute every code cell headless; progress on stderr, JSON summary on stdout\n\
--timeout: per-cell timeout in seconds (env: JUPYTER_MCP_EXECUTION_TIMEOUT_SECS; default: 120)\n\
--continue-on-error: keep going after a cell raises\n\
--save: write outputs back into the notebook\n\
exit status: 0 when all cells succeed, 1 on an execution or kernel failure, 2 on usage errors"
    );
}
