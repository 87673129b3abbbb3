use std::path::PathBuf;
use std::time::Duration;

pub const WORKING_DIR_ENV: &str = "JUPYTER_MCP_WORKING_DIR";
pub const PYTHON_ENV: &str = "JUPYTER_MCP_PYTHON";
pub const STARTUP_TIMEOUT_ENV: &str = "JUPYTER_MCP_STARTUP_TIMEOUT_SECS";
pub const EXECUTION_TIMEOUT_ENV: &str = "JUPYTER_MCP_EXECUTION_TIMEOUT_SECS";

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const MESSAGE_WAIT: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings for one supervisor. CLI flags are applied over `from_env`.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub working_dir: PathBuf,
    /// Skips environment resolution entirely when set.
    pub python_override: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub execution_timeout: Duration,
    pub message_wait: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl KernelConfig {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            python_override: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            message_wait: MESSAGE_WAIT,
            probe_timeout: PROBE_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let fallback_dir = std::env::current_dir()
            .map_err(|err| format!("failed to resolve current directory: {err}"))?;
        Self::from_lookup(fallback_dir, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(fallback_dir: PathBuf, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let working_dir = non_empty(WORKING_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or(fallback_dir);
        let mut config = Self::new(working_dir);
        config.python_override = non_empty(PYTHON_ENV).map(PathBuf::from);
        if let Some(value) = non_empty(STARTUP_TIMEOUT_ENV) {
            config.startup_timeout = parse_secs(&value, STARTUP_TIMEOUT_ENV)?;
        }
        if let Some(value) = non_empty(EXECUTION_TIMEOUT_ENV) {
            config.execution_timeout = parse_secs(&value, EXECUTION_TIMEOUT_ENV)?;
        }
        Ok(config)
    }
}

/// Parses a positive, finite number of seconds.
pub fn parse_secs(value: &str, name: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value for {name}: {value} (expected seconds)"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!(
            "invalid value for {name}: {value} (must be a positive number of seconds)"
        ));
    }
    Ok(Duration::from_secs_f64(secs))
}
