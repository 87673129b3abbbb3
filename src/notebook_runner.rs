use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::error::{FailureCategory, KernelError};
use crate::event_log;
use crate::kernel::KernelSupervisor;
use crate::kernel_protocol::ExecutionResult;
use crate::notebook::{self, DocumentError};

#[derive(Debug, Error)]
pub enum NotebookRunError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl NotebookRunError {
    pub fn category(&self) -> FailureCategory {
        match self {
            NotebookRunError::Document(_) => FailureCategory::DocumentError,
            NotebookRunError::Kernel(err) => err.category(),
        }
    }

    pub fn remediation(&self) -> Vec<String> {
        match self {
            NotebookRunError::Document(err) => err.remediation(),
            NotebookRunError::Kernel(err) => err.remediation(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellRun {
    pub index: usize,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotebookRun {
    pub path: PathBuf,
    pub code_cells: usize,
    pub executed: usize,
    pub failed: usize,
    /// Set when execution stopped before the last code cell.
    pub stopped_at: Option<usize>,
    pub saved: bool,
    pub cells: Vec<CellRun>,
}

impl NotebookRun {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.stopped_at.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub timeout: Duration,
    pub stop_on_error: bool,
    pub save: bool,
}

/// Executes the notebook's code cells in document order on `kernel`.
/// Empty cells are skipped without consuming an execution count. A timeout
/// or a dead kernel always stops the run; a user exception stops it only
/// when `stop_on_error` is set.
pub fn execute_notebook(
    kernel: &mut KernelSupervisor,
    path: &Path,
    options: RunOptions,
    mut on_cell: impl FnMut(&CellRun),
) -> Result<NotebookRun, NotebookRunError> {
    let cells = notebook::code_cells(path)?;
    event_log::log(
        "notebook_run_begin",
        json!({
            "path": path.to_string_lossy(),
            "code_cells": cells.len(),
            "stop_on_error": options.stop_on_error,
        }),
    );

    let mut run = NotebookRun {
        path: path.to_path_buf(),
        code_cells: cells.len(),
        executed: 0,
        failed: 0,
        stopped_at: None,
        saved: false,
        cells: Vec::new(),
    };
    for (position, (index, source)) in cells.iter().enumerate() {
        if source.trim().is_empty() {
            continue;
        }
        let result = kernel.execute_code(source, options.timeout)?;
        let control_failure = result.failure.is_some();
        let has_error = result.has_error;
        let cell = CellRun {
            index: *index,
            result,
        };
        on_cell(&cell);
        run.executed += 1;
        if has_error {
            run.failed += 1;
        }
        run.cells.push(cell);
        let is_last = position + 1 == cells.len();
        if !is_last && (control_failure || (has_error && options.stop_on_error)) {
            run.stopped_at = Some(*index);
            break;
        }
    }

    if options.save && !run.cells.is_empty() {
        let results: Vec<(usize, &ExecutionResult)> = run
            .cells
            .iter()
            .map(|cell| (cell.index, &cell.result))
            .collect();
        notebook::record_outputs(path, &results)?;
        run.saved = true;
    }
    event_log::log(
        "notebook_run_end",
        json!({
            "path": path.to_string_lossy(),
            "executed": run.executed,
            "failed": run.failed,
            "stopped_at": run.stopped_at,
            "saved": run.saved,
        }),
    );
    Ok(run)
}
