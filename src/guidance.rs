//! Static workflow guidance and state-based next-step suggestions.

use serde::Serialize;

use crate::classify;
use crate::inspect::VariableSummary;
use crate::kernel::{KernelStatus, LastErrorReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceTopic {
    SetupEnvironment,
    FixError,
    CreateNotebook,
    ExecuteCode,
    InstallPackage,
    ManageKernel,
    General,
}

impl GuidanceTopic {
    /// Unknown actions fall back to general guidance.
    pub fn parse(action: &str) -> Self {
        match action.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "setup_environment" | "setup" => GuidanceTopic::SetupEnvironment,
            "fix_error" | "error" | "debug" => GuidanceTopic::FixError,
            "create_notebook" | "notebook" => GuidanceTopic::CreateNotebook,
            "execute_code" | "execute" | "run" => GuidanceTopic::ExecuteCode,
            "install_package" | "install" | "dependencies" => GuidanceTopic::InstallPackage,
            "manage_kernel" | "kernel" => GuidanceTopic::ManageKernel,
            _ => GuidanceTopic::General,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuidanceStep {
    pub tool: &'static str,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guidance {
    pub topic: GuidanceTopic,
    pub steps: Vec<GuidanceStep>,
    pub tips: Vec<String>,
}

/// Error details a caller can pass along with `fix_error`.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub error_type: Option<String>,
    pub module: Option<String>,
}

fn step(tool: &'static str, purpose: impl Into<String>) -> GuidanceStep {
    GuidanceStep {
        tool,
        purpose: purpose.into(),
    }
}

fn tips(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| line.to_string()).collect()
}

pub fn guidance(topic: GuidanceTopic, context: &ErrorContext) -> Guidance {
    let (steps, tips) = match topic {
        GuidanceTopic::SetupEnvironment => (
            vec![
                step("jupyter_detect_environment", "see which environments the project already has"),
                step("jupyter_initialize", "create or reuse .venv, sync uv.lock and start the kernel"),
                step("jupyter_validate_setup", "confirm uv, the environment and its interpreter work"),
            ],
            tips(&[
                "Use uv for packages; jupyter_ensure_dependencies keeps uv.lock consistent",
                "A .python-version file selects the interpreter for a new .venv",
                "Run jupyter_sync_environment after pulling an updated uv.lock",
            ]),
        ),
        GuidanceTopic::FixError => (fix_error_steps(context), tips(&[
            "Read the exception type and message first",
            "The innermost frame of the traceback points at the failing line",
            "Apply the remediation hints returned with the failed execution",
        ])),
        GuidanceTopic::CreateNotebook => (
            vec![
                step("jupyter_initialize", "start the kernel in the project directory"),
                step("jupyter_create_notebook", "start from the data_analysis, ml_experiment or visualization template"),
                step("jupyter_add_cell", "add markdown for context and code with execute=true"),
                step("jupyter_get_notebook_info", "review cell order and which cells failed"),
            ],
            tips(&[
                "Open with a markdown cell that states the goal",
                "Keep imports in the first code cell",
                "Separate loading, processing and plotting into their own cells",
            ]),
        ),
        GuidanceTopic::ExecuteCode => (
            vec![
                step("jupyter_kernel_status", "check that the kernel is ready"),
                step("jupyter_execute_cell", "run code; variables persist between calls"),
                step("jupyter_inspect_namespace", "look at what the code defined"),
            ],
            tips(&[
                "Split long work into several cells",
                "Pass a larger timeout for slow cells instead of retrying",
                "An exception comes back as has_error with remediation hints",
            ]),
        ),
        GuidanceTopic::InstallPackage => (
            vec![
                step("jupyter_ensure_dependencies", "install missing packages with uv; present ones are skipped"),
                step("jupyter_restart_kernel", "reload the kernel when an installed package replaced an imported one"),
            ],
            tips(&[
                "Never run pip directly in a cell",
                "Use dev=true for test and tooling packages",
                "Some imports ship under another name: cv2 is opencv-python, sklearn is scikit-learn",
            ]),
        ),
        GuidanceTopic::ManageKernel => (
            vec![
                step("jupyter_kernel_status", "state, pid and execution count; answers while code runs"),
                step("jupyter_restart_kernel", "recover from a hung kernel or start clean"),
                step("jupyter_shutdown_kernel", "stop the kernel when done"),
            ],
            tips(&[
                "A dead kernel is started again by the next execution",
                "Restarting clears every variable; the execution counter keeps growing",
            ]),
        ),
        GuidanceTopic::General => (
            vec![
                step("jupyter_initialize", "prepare the environment and start the kernel"),
                step("jupyter_execute_cell", "run code"),
                step("jupyter_ensure_dependencies", "install packages reported as missing"),
                step("jupyter_add_cell", "record the work in a notebook"),
            ],
            tips(&[
                "Call jupyter_get_guidance with a specific action for details",
                "jupyter_what_next suggests steps from the current kernel state",
            ]),
        ),
    };
    Guidance { topic, steps, tips }
}

fn fix_error_steps(context: &ErrorContext) -> Vec<GuidanceStep> {
    let mut steps = vec![step("jupyter_debug_last_error", "classify the most recent exception")];
    match context.error_type.as_deref() {
        Some("ModuleNotFoundError") | Some("ImportError") => {
            let purpose = match context.module.as_deref() {
                Some(module) => format!(
                    "install {} (the distribution providing `{module}`)",
                    classify::package_for_import(module)
                ),
                None => "install the missing distribution".to_string(),
            };
            steps.push(step("jupyter_ensure_dependencies", purpose));
            steps.push(step("jupyter_execute_cell", "run the failing cell again"));
        }
        Some("FileNotFoundError") => {
            steps.push(step("jupyter_kernel_status", "check the kernel's working_dir"));
            steps.push(step("jupyter_execute_cell", "list the directory or fix the relative path"));
        }
        Some("NameError") | Some("AttributeError") | Some("KeyError") => {
            steps.push(step("jupyter_inspect_namespace", "see which names are defined"));
            steps.push(step("jupyter_inspect_variable", "check the object's type and attributes"));
        }
        _ => steps.push(step("jupyter_execute_cell", "run a corrected version of the cell")),
    }
    steps
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub priority: u8,
    pub action: String,
    pub reason: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextSteps {
    pub kernel_running: bool,
    pub execution_count: u64,
    pub variables_defined: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub recommendations: Vec<Recommendation>,
}

const LISTED_VARIABLES: usize = 10;

/// Ranks follow-up actions from a status snapshot, the namespace (empty when
/// no kernel runs) and the last recorded exception.
pub fn what_next(
    status: &KernelStatus,
    variables: &[VariableSummary],
    last_error: Option<&LastErrorReport>,
    goal: Option<String>,
) -> NextSteps {
    let mut recommendations = Vec::new();

    if !status.running {
        recommendations.push(Recommendation {
            priority: 1,
            action: "Start the kernel".to_string(),
            reason: format!("kernel is {}", status.state.as_str()),
            tool: "jupyter_initialize".to_string(),
            code: None,
        });
    }

    // Only an exception from the latest execution is still actionable.
    if let Some(report) =
        last_error.filter(|report| report.error.execution_count == status.execution_count)
    {
        let guidance = &report.classification.guidance;
        recommendations.push(Recommendation {
            priority: 1,
            action: guidance
                .action
                .clone()
                .unwrap_or_else(|| format!("Fix the {}", report.error.ename)),
            reason: format!("{}: {}", report.error.ename, report.error.evalue),
            tool: guidance
                .next_tool
                .clone()
                .unwrap_or_else(|| "jupyter_debug_last_error".to_string()),
            code: None,
        });
    }

    for variable in variables {
        if variable.type_name == "DataFrame" {
            let shape = variable
                .shape
                .as_ref()
                .map(|dims| format!("{dims:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            recommendations.push(Recommendation {
                priority: 2,
                action: format!("Explore DataFrame `{}`", variable.name),
                reason: format!("shape {shape}"),
                tool: "jupyter_execute_cell".to_string(),
                code: Some(format!("{}.describe()", variable.name)),
            });
        } else if looks_like_model(variable) {
            recommendations.push(Recommendation {
                priority: 2,
                action: format!("Evaluate model `{}`", variable.name),
                reason: format!("{} object in the namespace", variable.type_name),
                tool: "jupyter_inspect_variable".to_string(),
                code: None,
            });
        }
    }

    if recommendations.is_empty() {
        let (action, code) = if variables.is_empty() {
            (
                "Import the libraries the task needs",
                "import pandas as pd\nimport numpy as np\nimport matplotlib.pyplot as plt",
            )
        } else {
            ("Continue from the defined variables", "")
        };
        recommendations.push(Recommendation {
            priority: 3,
            action: action.to_string(),
            reason: "kernel is ready".to_string(),
            tool: "jupyter_execute_cell".to_string(),
            code: (!code.is_empty()).then(|| code.to_string()),
        });
    }

    recommendations.sort_by_key(|recommendation| recommendation.priority);
    NextSteps {
        kernel_running: status.running,
        execution_count: status.execution_count,
        variables_defined: variables
            .iter()
            .take(LISTED_VARIABLES)
            .map(|variable| variable.name.clone())
            .collect(),
        goal,
        recommendations,
    }
}

fn looks_like_model(variable: &VariableSummary) -> bool {
    if variable.kind != "variable" {
        return false;
    }
    let module = variable.module.as_deref().unwrap_or("");
    variable.name == "model"
        || ["sklearn", "torch", "xgboost", "lightgbm", "keras"]
            .iter()
            .any(|prefix| module.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelState, LastError};
    use std::path::PathBuf;

    fn status(running: bool, execution_count: u64) -> KernelStatus {
        KernelStatus {
            state: if running {
                KernelState::Ready
            } else {
                KernelState::NotStarted
            },
            running,
            pid: running.then_some(4242),
            execution_count,
            session_id: None,
            python: None,
            provenance: None,
            started_at_unix_ms: None,
            working_dir: PathBuf::from("/work"),
            last_start_failure: None,
        }
    }

    fn variable(name: &str, type_name: &str, module: Option<&str>) -> VariableSummary {
        VariableSummary {
            name: name.to_string(),
            type_name: type_name.to_string(),
            kind: "variable".to_string(),
            module: module.map(str::to_string),
            repr: "...".to_string(),
            length: None,
            shape: (type_name == "DataFrame").then(|| vec![10, 3]),
            dtype: None,
        }
    }

    fn last_error(execution_count: u64, ename: &str, evalue: &str) -> LastErrorReport {
        let error = LastError {
            execution_count,
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback: Vec::new(),
        };
        let classification = classify::classify(ename, evalue, &[]);
        LastErrorReport {
            error,
            classification,
        }
    }

    #[test]
    fn actions_map_to_topics() {
        assert_eq!(GuidanceTopic::parse("setup_environment"), GuidanceTopic::SetupEnvironment);
        assert_eq!(GuidanceTopic::parse("Fix-Error"), GuidanceTopic::FixError);
        assert_eq!(GuidanceTopic::parse("kernel"), GuidanceTopic::ManageKernel);
        assert_eq!(GuidanceTopic::parse("dance"), GuidanceTopic::General);
    }

    #[test]
    fn missing_module_guidance_names_the_distribution() {
        let context = ErrorContext {
            error_type: Some("ModuleNotFoundError".to_string()),
            module: Some("sklearn".to_string()),
        };
        let guidance = guidance(GuidanceTopic::FixError, &context);
        let tools: Vec<&str> = guidance.steps.iter().map(|step| step.tool).collect();
        assert_eq!(
            tools,
            vec![
                "jupyter_debug_last_error",
                "jupyter_ensure_dependencies",
                "jupyter_execute_cell"
            ]
        );
        assert!(guidance.steps[1].purpose.contains("scikit-learn"));
    }

    #[test]
    fn stopped_kernel_recommends_initialize_first() {
        let next = what_next(&status(false, 0), &[], None, Some("plot sales".to_string()));
        assert!(!next.kernel_running);
        assert_eq!(next.recommendations[0].tool, "jupyter_initialize");
        assert_eq!(next.recommendations[0].priority, 1);
        assert_eq!(next.goal.as_deref(), Some("plot sales"));
    }

    #[test]
    fn dataframes_and_models_get_their_own_suggestions() {
        let variables = vec![
            variable("sales", "DataFrame", Some("pandas.core.frame")),
            variable("clf", "RandomForestClassifier", Some("sklearn.ensemble._forest")),
            variable("n", "int", None),
        ];
        let next = what_next(&status(true, 4), &variables, None, None);
        let actions: Vec<&str> = next
            .recommendations
            .iter()
            .map(|recommendation| recommendation.action.as_str())
            .collect();
        assert_eq!(
            actions,
            vec!["Explore DataFrame `sales`", "Evaluate model `clf`"]
        );
        assert_eq!(next.recommendations[0].code.as_deref(), Some("sales.describe()"));
        assert_eq!(next.variables_defined, vec!["sales", "clf", "n"]);
    }

    #[test]
    fn only_a_recent_exception_is_suggested() {
        let recent = last_error(5, "ZeroDivisionError", "division by zero");
        let next = what_next(&status(true, 5), &[], Some(&recent), None);
        assert_eq!(next.recommendations[0].priority, 1);
        assert_eq!(
            next.recommendations[0].reason,
            "ZeroDivisionError: division by zero"
        );

        let stale = last_error(2, "ZeroDivisionError", "division by zero");
        let next = what_next(&status(true, 9), &[], Some(&stale), None);
        assert_eq!(next.recommendations.len(), 1);
        assert_eq!(next.recommendations[0].priority, 3);
    }
}
