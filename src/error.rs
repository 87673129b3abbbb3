use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::environment::EnvironmentError;

/// Machine-checkable tag attached to every failure payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    StartupFailure,
    Timeout,
    ProcessDied,
    ProtocolError,
    ExecutionError,
    DependencyFailure,
    DocumentError,
    InvalidRequest,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::StartupFailure => "startup_failure",
            FailureCategory::Timeout => "timeout",
            FailureCategory::ProcessDied => "process_died",
            FailureCategory::ProtocolError => "protocol_error",
            FailureCategory::ExecutionError => "execution_error",
            FailureCategory::DependencyFailure => "dependency_failure",
            FailureCategory::DocumentError => "document_error",
            FailureCategory::InvalidRequest => "invalid_request",
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel failed to start: {message}")]
    Startup {
        message: String,
        stderr_tail: Option<String>,
    },
    #[error("kernel did not become ready within {} ms", .0.as_millis())]
    StartupTimeout(Duration),
    #[error("execution did not finish within {} s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("kernel process is not running: {0}")]
    ProcessDied(String),
    #[error("source must contain code to execute")]
    EmptySource,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("kernel protocol error: {0}")]
    Protocol(String),
    #[error("kernel io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

impl KernelError {
    pub fn category(&self) -> FailureCategory {
        match self {
            KernelError::Startup { .. }
            | KernelError::StartupTimeout(_)
            | KernelError::Environment(_) => FailureCategory::StartupFailure,
            KernelError::Timeout(_) => FailureCategory::Timeout,
            KernelError::ProcessDied(_) | KernelError::Io(_) => FailureCategory::ProcessDied,
            KernelError::EmptySource | KernelError::InvalidRequest(_) => {
                FailureCategory::InvalidRequest
            }
            KernelError::Protocol(_) => FailureCategory::ProtocolError,
        }
    }

    pub fn remediation(&self) -> Vec<String> {
        match self {
            KernelError::Startup { stderr_tail, .. } => {
                let mut hints = vec![
                    "Check that the environment's Python interpreter runs (jupyter_validate_setup)"
                        .to_string(),
                    "Create a project environment with jupyter_setup_environment".to_string(),
                ];
                if let Some(tail) = stderr_tail
                    && !tail.trim().is_empty()
                {
                    hints.push(format!("Interpreter stderr: {}", tail.trim()));
                }
                hints
            }
            KernelError::StartupTimeout(_) => vec![
                "The interpreter started but never reported ready; retry with jupyter_restart_kernel"
                    .to_string(),
                "Raise JUPYTER_MCP_STARTUP_TIMEOUT_SECS if the environment is slow to import"
                    .to_string(),
            ],
            KernelError::Timeout(timeout) => crate::classify::timeout_remediation(*timeout),
            KernelError::ProcessDied(_) | KernelError::Io(_) => vec![
                "Restart the kernel with jupyter_restart_kernel; in-memory state was lost"
                    .to_string(),
            ],
            KernelError::EmptySource => vec!["Pass non-empty code".to_string()],
            KernelError::InvalidRequest(_) => Vec::new(),
            KernelError::Protocol(_) => {
                vec!["Restart the kernel with jupyter_restart_kernel".to_string()]
            }
            KernelError::Environment(err) => err.remediation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_tags_are_snake_case() {
        let value = serde_json::to_value(FailureCategory::DependencyFailure).expect("serialize");
        assert_eq!(value, serde_json::json!("dependency_failure"));
        assert_eq!(FailureCategory::ProcessDied.as_str(), "process_died");
    }

    #[test]
    fn startup_failure_includes_stderr_tail_hint() {
        let err = KernelError::Startup {
            message: "exited with status 1".to_string(),
            stderr_tail: Some("ImportError: bad site-packages\n".to_string()),
        };
        assert_eq!(err.category(), FailureCategory::StartupFailure);
        let hints = err.remediation();
        assert!(
            hints
                .iter()
                .any(|hint| hint.contains("ImportError: bad site-packages")),
            "{hints:?}"
        );
    }
}
