use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::kernel_protocol::{ExecutionResult, MimeBundle, ResultEvent};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("notebook not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("notebook already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("failed to parse notebook {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("cell index {index} is out of range (notebook has {len} cells)")]
    OutOfRange { index: usize, len: usize },
    #[error("invalid cell type {0:?} (expected \"code\" or \"markdown\")")]
    InvalidCellType(String),
    #[error("invalid template {0:?}")]
    InvalidTemplate(String),
    #[error("notebook io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocumentError {
    pub fn remediation(&self) -> Vec<String> {
        match self {
            DocumentError::NotFound(_) => {
                vec!["Create it with jupyter_create_notebook or check the path".to_string()]
            }
            DocumentError::AlreadyExists(_) => {
                vec!["Choose another path, or add cells with jupyter_add_cell".to_string()]
            }
            DocumentError::Parse { .. } => {
                vec!["The file is not valid nbformat 4 JSON; restore it or use another path".to_string()]
            }
            DocumentError::OutOfRange { len, .. } => vec![format!(
                "Use an index between 0 and {}; jupyter_get_notebook_info lists the cells",
                len.saturating_sub(1)
            )],
            DocumentError::InvalidCellType(_) => vec!["Use \"code\" or \"markdown\"".to_string()],
            DocumentError::InvalidTemplate(_) => vec![
                "Use one of: default, data_analysis, ml_experiment, visualization".to_string(),
            ],
            DocumentError::Io(_) => vec!["Check file permissions and the directory".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    /// Types a caller may add; raw cells are only preserved.
    pub fn parse(value: &str) -> Result<Self, DocumentError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            other => Err(DocumentError::InvalidCellType(other.to_string())),
        }
    }
}

/// Cell text. Stored on disk as a list of lines, read from either form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Source(pub String);

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let lines: Vec<&str> = self.0.split_inclusive('\n').collect();
        lines.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Lines(Vec<String>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Source(text),
            Raw::Lines(lines) => Source(lines.concat()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub source: Source,
    /// Code cells only; `Some(Value::Null)` keeps the explicit null on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    fn new(cell_type: CellType, content: &str, id: String) -> Self {
        let is_code = cell_type == CellType::Code;
        Self {
            cell_type,
            id: Some(id),
            metadata: Map::new(),
            source: Source(content.to_string()),
            execution_count: is_code.then_some(Value::Null),
            outputs: is_code.then(Vec::new),
            extra: Map::new(),
        }
    }

    fn set_results(&mut self, result: Option<&ExecutionResult>) {
        if self.cell_type != CellType::Code {
            return;
        }
        match result {
            Some(result) => {
                self.execution_count = Some(json!(result.execution_count));
                self.outputs = Some(result.outputs.iter().filter_map(output_record).collect());
            }
            None => {
                self.execution_count = Some(Value::Null);
                self.outputs = Some(Vec::new());
            }
        }
    }

    fn summary(&self, index: usize) -> CellSummary {
        let text = &self.source.0;
        let first_line = text.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
        let mut preview: String = first_line.chars().take(PREVIEW_CHARS).collect();
        if first_line.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        let outputs = self.outputs.as_deref().unwrap_or_default();
        CellSummary {
            index,
            cell_type: self.cell_type,
            preview,
            line_count: text.lines().count(),
            execution_count: self.execution_count.as_ref().and_then(Value::as_u64),
            output_count: outputs.len(),
            has_error: outputs
                .iter()
                .any(|output| output.get("output_type").and_then(Value::as_str) == Some("error")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notebook {
    fn empty() -> Self {
        let mut metadata = Map::new();
        metadata.insert(
            "kernelspec".to_string(),
            json!({"display_name": "Python 3", "language": "python", "name": "python3"}),
        );
        metadata.insert("language_info".to_string(), json!({"name": "python"}));
        Self {
            cells: Vec::new(),
            metadata,
            nbformat: 4,
            nbformat_minor: 5,
            extra: Map::new(),
        }
    }

    fn push_cell(&mut self, cell_type: CellType, content: &str) {
        let id = self.fresh_id();
        self.cells.push(Cell::new(cell_type, content, id));
    }

    fn fresh_id(&self) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        loop {
            let seed = crate::event_log::unix_ms_now() as u64
                ^ (u64::from(std::process::id()) << 20)
                ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let id = format!("{:08x}", seed & 0xffff_ffff);
            if !self.cells.iter().any(|cell| cell.id.as_deref() == Some(id.as_str())) {
                return id;
            }
        }
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata
            .get("kernelspec")
            .and_then(|spec| spec.get("language"))
            .or_else(|| self.metadata.get("language_info").and_then(|info| info.get("name")))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellSummary {
    pub index: usize,
    pub cell_type: CellType,
    pub preview: String,
    pub line_count: usize,
    pub execution_count: Option<u64>,
    pub output_count: usize,
    pub has_error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotebookSummary {
    pub path: PathBuf,
    pub cell_count: usize,
    pub code_cells: usize,
    pub markdown_cells: usize,
    pub language: Option<String>,
    pub nbformat: String,
    pub cells: Vec<CellSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellWrite {
    pub path: PathBuf,
    pub index: usize,
    pub cell_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Default,
    DataAnalysis,
    MlExperiment,
    Visualization,
}

impl Template {
    pub fn parse(value: &str) -> Result<Self, DocumentError> {
        match value.trim() {
            "" | "default" => Ok(Template::Default),
            "data_analysis" => Ok(Template::DataAnalysis),
            "ml_experiment" => Ok(Template::MlExperiment),
            "visualization" => Ok(Template::Visualization),
            other => Err(DocumentError::InvalidTemplate(other.to_string())),
        }
    }

    fn cells(self, title: &str) -> Vec<(CellType, String)> {
        let heading = (CellType::Markdown, format!("# {title}"));
        let rest: &[(CellType, &str)] = match self {
            Template::Default => &[(CellType::Code, "")],
            Template::DataAnalysis => &[
                (CellType::Code, "import pandas as pd\nimport numpy as np\nimport matplotlib.pyplot as plt"),
                (CellType::Markdown, "## Load data"),
                (CellType::Code, "df = pd.read_csv(\"data.csv\")\ndf.head()"),
                (CellType::Markdown, "## Explore"),
                (CellType::Code, "df.describe()"),
            ],
            Template::MlExperiment => &[
                (CellType::Code, "import numpy as np\nimport pandas as pd\nfrom sklearn.model_selection import train_test_split\nfrom sklearn.metrics import accuracy_score"),
                (CellType::Markdown, "## Data preparation"),
                (CellType::Code, "X_train, X_test, y_train, y_test = train_test_split(X, y, test_size=0.2, random_state=42)"),
                (CellType::Markdown, "## Model"),
                (CellType::Code, "model.fit(X_train, y_train)"),
                (CellType::Markdown, "## Evaluation"),
                (CellType::Code, "accuracy_score(y_test, model.predict(X_test))"),
            ],
            Template::Visualization => &[
                (CellType::Code, "import matplotlib.pyplot as plt\nimport numpy as np"),
                (CellType::Markdown, "## Plot"),
                (CellType::Code, "x = np.linspace(0, 10, 200)\nplt.plot(x, np.sin(x))\nplt.title(\"sin(x)\")\nplt.show()"),
            ],
        };
        std::iter::once(heading)
            .chain(rest.iter().map(|(cell_type, text)| (*cell_type, text.to_string())))
            .collect()
    }
}

/// Appends `.ipynb` when the path has another or no extension.
pub fn with_notebook_extension(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "ipynb") {
        path.to_path_buf()
    } else {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(".ipynb");
        PathBuf::from(raw)
    }
}

pub fn read(path: &Path) -> Result<Notebook, DocumentError> {
    let text = fs::read_to_string(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => DocumentError::NotFound(path.to_path_buf()),
        _ => DocumentError::Io(err),
    })?;
    serde_json::from_str(&text).map_err(|err| DocumentError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Writes through a sibling temp file so readers never see a partial document.
pub fn write(path: &Path, notebook: &Notebook) -> Result<(), DocumentError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    notebook
        .serialize(&mut serializer)
        .map_err(|err| DocumentError::Io(std::io::Error::other(err)))?;
    bytes.push(b'\n');

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "notebook.ipynb".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

fn read_or_new(path: &Path) -> Result<Notebook, DocumentError> {
    match read(path) {
        Err(DocumentError::NotFound(_)) => Ok(Notebook::empty()),
        other => other,
    }
}

pub fn create(
    path: &Path,
    template: Template,
    title: Option<&str>,
) -> Result<NotebookSummary, DocumentError> {
    let path = with_notebook_extension(path);
    if path.exists() {
        return Err(DocumentError::AlreadyExists(path));
    }
    let title = title
        .map(str::to_string)
        .filter(|title| !title.trim().is_empty())
        .or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().replace(['_', '-'], " "))
        })
        .unwrap_or_else(|| "Notebook".to_string());
    let mut notebook = Notebook::empty();
    for (cell_type, content) in template.cells(&title) {
        notebook.push_cell(cell_type, &content);
    }
    write(&path, &notebook)?;
    Ok(summarize(&path, &notebook))
}

/// Creates the notebook when it does not exist yet.
pub fn append_cell(
    path: &Path,
    cell_type: CellType,
    content: &str,
    result: Option<&ExecutionResult>,
) -> Result<CellWrite, DocumentError> {
    let mut notebook = read_or_new(path)?;
    notebook.push_cell(cell_type, content);
    let index = notebook.cells.len() - 1;
    notebook.cells[index].set_results(result);
    write(path, &notebook)?;
    Ok(CellWrite {
        path: path.to_path_buf(),
        index,
        cell_count: notebook.cells.len(),
    })
}

pub fn insert_cell(
    path: &Path,
    position: usize,
    cell_type: CellType,
    content: &str,
    result: Option<&ExecutionResult>,
) -> Result<CellWrite, DocumentError> {
    let mut notebook = read_or_new(path)?;
    let len = notebook.cells.len();
    if position > len {
        return Err(DocumentError::OutOfRange {
            index: position,
            len,
        });
    }
    let mut cell = Cell::new(cell_type, content, notebook.fresh_id());
    cell.set_results(result);
    notebook.cells.insert(position, cell);
    write(path, &notebook)?;
    Ok(CellWrite {
        path: path.to_path_buf(),
        index: position,
        cell_count: notebook.cells.len(),
    })
}

/// Replaces a cell's source. Outputs are replaced by `result`, or cleared.
pub fn update_cell(
    path: &Path,
    index: usize,
    content: &str,
    result: Option<&ExecutionResult>,
) -> Result<CellWrite, DocumentError> {
    let mut notebook = read(path)?;
    let len = notebook.cells.len();
    let cell = notebook
        .cells
        .get_mut(index)
        .ok_or(DocumentError::OutOfRange { index, len })?;
    cell.source = Source(content.to_string());
    cell.set_results(result);
    write(path, &notebook)?;
    Ok(CellWrite {
        path: path.to_path_buf(),
        index,
        cell_count: len,
    })
}

/// Stores execution results on existing code cells in a single write.
pub fn record_outputs(
    path: &Path,
    results: &[(usize, &ExecutionResult)],
) -> Result<(), DocumentError> {
    let mut notebook = read(path)?;
    let len = notebook.cells.len();
    for (index, result) in results {
        let cell = notebook
            .cells
            .get_mut(*index)
            .ok_or(DocumentError::OutOfRange { index: *index, len })?;
        cell.set_results(Some(result));
    }
    write(path, &notebook)
}

pub fn describe(path: &Path) -> Result<NotebookSummary, DocumentError> {
    let notebook = read(path)?;
    Ok(summarize(path, &notebook))
}

/// Index and source of every code cell, in document order.
pub fn code_cells(path: &Path) -> Result<Vec<(usize, String)>, DocumentError> {
    let notebook = read(path)?;
    Ok(notebook
        .cells
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.cell_type == CellType::Code)
        .map(|(index, cell)| (index, cell.source.0.clone()))
        .collect())
}

fn summarize(path: &Path, notebook: &Notebook) -> NotebookSummary {
    let count = |wanted: CellType| {
        notebook
            .cells
            .iter()
            .filter(|cell| cell.cell_type == wanted)
            .count()
    };
    NotebookSummary {
        path: path.to_path_buf(),
        cell_count: notebook.cells.len(),
        code_cells: count(CellType::Code),
        markdown_cells: count(CellType::Markdown),
        language: notebook.language().map(str::to_string),
        nbformat: format!("{}.{}", notebook.nbformat, notebook.nbformat_minor),
        cells: notebook
            .cells
            .iter()
            .enumerate()
            .map(|(index, cell)| cell.summary(index))
            .collect(),
    }
}

/// nbformat output record for a result event. Opaque events have no
/// nbformat equivalent and are left out.
fn output_record(event: &ResultEvent) -> Option<Value> {
    match event {
        ResultEvent::Stream { name, text } => Some(json!({
            "output_type": "stream",
            "name": name.as_str(),
            "text": split_lines(text),
        })),
        ResultEvent::ExecuteResult {
            data,
            metadata,
            execution_count,
        } => Some(json!({
            "output_type": "execute_result",
            "data": bundle_for_disk(data),
            "metadata": metadata,
            "execution_count": execution_count,
        })),
        ResultEvent::DisplayData { data, metadata } => Some(json!({
            "output_type": "display_data",
            "data": bundle_for_disk(data),
            "metadata": metadata,
        })),
        ResultEvent::Error {
            ename,
            evalue,
            traceback,
        } => Some(json!({
            "output_type": "error",
            "ename": ename,
            "evalue": evalue,
            "traceback": traceback,
        })),
        ResultEvent::Other { .. } => None,
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Text representations are stored as line lists; images and JSON stay as is.
fn bundle_for_disk(data: &MimeBundle) -> Map<String, Value> {
    data.iter()
        .map(|(mime, value)| {
            let stored = match value {
                Value::String(text)
                    if mime.starts_with("text/") || mime == "image/svg+xml" =>
                {
                    json!(split_lines(text))
                }
                other => other.clone(),
            };
            (mime.clone(), stored)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outputs: Vec<ResultEvent>, execution_count: u64) -> ExecutionResult {
        ExecutionResult {
            execution_count,
            has_error: outputs.iter().any(ResultEvent::is_error),
            outputs,
            remediation: None,
            classification: None,
            failure: None,
            skipped_messages: 0,
        }
    }

    #[test]
    fn appended_source_round_trips_exactly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fresh.ipynb");
        let source = "x = 5\n\nprint(x)\n  # trailing\nno newline at end";
        let written = append_cell(&path, CellType::Code, source, None).expect("append");
        assert_eq!(written.index, 0);

        let notebook = read(&path).expect("read back");
        assert_eq!(notebook.cells[0].source.0, source);
        assert_eq!(notebook.cells[0].execution_count, Some(Value::Null));
        assert_eq!(notebook.nbformat, 4);
    }

    #[test]
    fn update_out_of_range_is_a_clear_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nb.ipynb");
        append_cell(&path, CellType::Markdown, "# Title", None).expect("append");
        let err = update_cell(&path, 3, "print(1)", None).expect_err("out of range");
        assert!(matches!(err, DocumentError::OutOfRange { index: 3, len: 1 }));
        insta::assert_snapshot!(err.to_string(), @"cell index 3 is out of range (notebook has 1 cells)");
    }

    #[test]
    fn results_become_nbformat_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nb.ipynb");
        let execution = result(
            vec![
                ResultEvent::stdout("a\nb\n"),
                ResultEvent::ExecuteResult {
                    data: MimeBundle::from([("text/plain".to_string(), json!("42"))]),
                    metadata: Default::default(),
                    execution_count: 7,
                },
                ResultEvent::Other {
                    msg_type: "clear_output".to_string(),
                    content: json!({}),
                },
            ],
            7,
        );
        append_cell(&path, CellType::Code, "print('a\\nb')\n42", Some(&execution)).expect("append");

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        let cell = &raw["cells"][0];
        assert_eq!(cell["execution_count"], 7);
        assert_eq!(cell["outputs"].as_array().map(Vec::len), Some(2));
        assert_eq!(cell["outputs"][0]["text"], json!(["a\n", "b\n"]));
        assert_eq!(cell["outputs"][1]["data"]["text/plain"], json!(["42"]));

        let summary = describe(&path).expect("describe");
        assert_eq!(summary.cells[0].output_count, 2);
        assert_eq!(summary.cells[0].execution_count, Some(7));
        assert!(!summary.cells[0].has_error);
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("legacy.ipynb");
        fs::write(
            &path,
            r##"{"cells":[{"cell_type":"raw","metadata":{},"source":"raw text","attachments":{"a":1}}],
"metadata":{"custom":true},"nbformat":4,"nbformat_minor":2,"widgets":{"state":{}}}"##,
        )
        .expect("seed");
        append_cell(&path, CellType::Markdown, "note", None).expect("append");

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["widgets"], json!({"state": {}}));
        assert_eq!(raw["metadata"]["custom"], true);
        assert_eq!(raw["cells"][0]["attachments"], json!({"a": 1}));
        assert_eq!(raw["cells"][0]["source"], json!(["raw text"]));
        assert!(raw["cells"][1].get("outputs").is_none());
    }

    #[test]
    fn create_uses_template_and_enforces_extension() {
        let temp = tempfile::tempdir().expect("tempdir");
        let summary =
            create(&temp.path().join("sales_report"), Template::DataAnalysis, None).expect("create");
        assert!(summary.path.ends_with("sales_report.ipynb"));
        assert_eq!(summary.cells[0].preview, "# sales report");
        assert!(summary.code_cells >= 2);
        assert_eq!(summary.language.as_deref(), Some("python"));

        let err = create(&summary.path, Template::Default, None).expect_err("exists");
        assert!(matches!(err, DocumentError::AlreadyExists(_)));
        assert!(matches!(
            Template::parse("dashboard"),
            Err(DocumentError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn insert_and_code_cells_follow_document_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nb.ipynb");
        append_cell(&path, CellType::Code, "a = 1", None).expect("append");
        append_cell(&path, CellType::Code, "c = 3", None).expect("append");
        insert_cell(&path, 1, CellType::Markdown, "between", None).expect("insert");
        insert_cell(&path, 0, CellType::Code, "first = 0", None).expect("insert");
        assert!(matches!(
            insert_cell(&path, 9, CellType::Code, "x", None),
            Err(DocumentError::OutOfRange { index: 9, len: 4 })
        ));
        let cells = code_cells(&path).expect("code cells");
        assert_eq!(
            cells,
            vec![
                (0, "first = 0".to_string()),
                (1, "a = 1".to_string()),
                (3, "c = 3".to_string()),
            ]
        );
        let notebook = read(&path).expect("read");
        let mut ids: Vec<_> = notebook.cells.iter().filter_map(|cell| cell.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn cell_type_parsing_rejects_raw() {
        assert_eq!(CellType::parse("Markdown").expect("markdown"), CellType::Markdown);
        assert!(matches!(
            CellType::parse("raw"),
            Err(DocumentError::InvalidCellType(_))
        ));
    }
}
