use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::kernel_protocol::{ExecutionResult, ResultEvent, StreamName};

const NAMESPACE_MARKER: &str = "__JUPYTER_MCP_NAMESPACE__";
const VARIABLE_MARKER: &str = "__JUPYTER_MCP_VARIABLE__";
const PROFILE_MARKER: &str = "__JUPYTER_MCP_PROFILE__";
const PROFILE_ROWS: usize = 20;

/// One top-level binding with coarse type and shape metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub repr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub repr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Python shared by both snippets: builds a metadata dict for one value.
const DESCRIBE_HELPER: &str = r#"
def _jmcp_describe(name, value, repr_limit):
    import types as _types
    info = {"name": name, "type": type(value).__name__}
    if isinstance(value, _types.ModuleType):
        info["kind"] = "module"
    elif isinstance(value, type):
        info["kind"] = "class"
    elif callable(value):
        info["kind"] = "function"
    else:
        info["kind"] = "variable"
    module = getattr(type(value), "__module__", None)
    if module and module != "builtins":
        info["module"] = module
    try:
        text = repr(value)
    except Exception as exc:
        text = "<repr failed: {}>".format(exc)
    if len(text) > repr_limit:
        text = text[:repr_limit] + "..."
    info["repr"] = text
    try:
        if not isinstance(value, (str, bytes, type)) and hasattr(value, "__len__"):
            info["length"] = int(len(value))
    except Exception:
        pass
    try:
        shape = getattr(value, "shape", None)
        if shape is not None and not callable(shape):
            info["shape"] = [int(dim) for dim in shape]
    except Exception:
        pass
    try:
        dtype = getattr(value, "dtype", None)
        if dtype is not None and not callable(dtype):
            info["dtype"] = str(dtype)
    except Exception:
        pass
    return info
"#;

/// Snippet that prints every public top-level binding, optionally filtered by
/// a regular expression searched in the name.
pub fn namespace_snippet(filter: Option<&str>) -> String {
    let filter_literal = python_string_or_none(filter);
    format!(
        r#"{DESCRIBE_HELPER}
def _jmcp_namespace(pattern):
    import json as _json
    import re as _re
    import types as _types
    matcher = _re.compile(pattern) if pattern else None
    entries = []
    for name, value in sorted(globals().items()):
        if name.startswith("_") or name in ("In", "Out", "exit", "quit", "get_ipython"):
            continue
        if isinstance(value, _types.ModuleType):
            continue
        if matcher is not None and not matcher.search(name):
            continue
        entries.append(_jmcp_describe(name, value, 120))
    print("{NAMESPACE_MARKER}" + _json.dumps(entries, default=str))

try:
    _jmcp_namespace({filter_literal})
finally:
    del _jmcp_namespace, _jmcp_describe
"#
    )
}

/// Snippet describing a single variable in detail. Fails before touching the
/// interpreter when `name` is not a plain identifier.
pub fn variable_snippet(name: &str) -> Result<String, KernelError> {
    if !is_identifier(name) {
        return Err(KernelError::InvalidRequest(format!(
            "'{name}' is not a valid Python identifier"
        )));
    }
    let name_literal = python_string_or_none(Some(name));
    Ok(format!(
        r#"{DESCRIBE_HELPER}
def _jmcp_variable(name):
    import json as _json
    scope = globals()
    if name not in scope:
        raise NameError("name '{{}}' is not defined".format(name))
    value = scope[name]
    info = _jmcp_describe(name, value, 2000)
    info.pop("kind", None)
    try:
        columns = getattr(value, "columns", None)
        if columns is not None and not callable(columns):
            info["columns"] = [str(column) for column in list(columns)[:100]]
    except Exception:
        pass
    try:
        nbytes = getattr(value, "nbytes", None)
        if isinstance(nbytes, int):
            info["size_bytes"] = nbytes
        else:
            import sys as _sys
            info["size_bytes"] = int(_sys.getsizeof(value))
    except Exception:
        pass
    info["attributes"] = [attr for attr in dir(value) if not attr.startswith("_")][:50]
    print("{VARIABLE_MARKER}" + _json.dumps(info, default=str))

try:
    _jmcp_variable({name_literal})
finally:
    del _jmcp_variable, _jmcp_describe
"#
    ))
}

/// pstats ordering for a profile report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSort {
    Cumulative,
    Time,
    Calls,
}

impl ProfileSort {
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value.trim() {
            "cumulative" | "cumtime" => Ok(ProfileSort::Cumulative),
            "time" | "tottime" => Ok(ProfileSort::Time),
            "calls" | "ncalls" => Ok(ProfileSort::Calls),
            other => Err(KernelError::InvalidRequest(format!(
                "unknown sort_by {other:?}; expected cumulative, time or calls"
            ))),
        }
    }

    fn pstats_key(self) -> &'static str {
        match self {
            ProfileSort::Cumulative => "cumulative",
            ProfileSort::Time => "tottime",
            ProfileSort::Calls => "calls",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub total_calls: u64,
    pub total_seconds: f64,
    /// pstats table of the top functions.
    pub stats: String,
}

/// Snippet that runs `code` in the user namespace under cProfile and prints
/// the top of the pstats table, also when `code` raises.
pub fn profile_snippet(code: &str, sort: ProfileSort) -> String {
    let code_literal = python_string_or_none(Some(code));
    let sort_key = sort.pstats_key();
    format!(
        r#"
def _jmcp_profile(source, sort_key, limit):
    import cProfile as _cProfile
    import io as _io
    import json as _json
    import pstats as _pstats
    compiled = compile(source, "<profiled>", "exec")
    profiler = _cProfile.Profile()
    try:
        profiler.runctx(compiled, globals(), globals())
    finally:
        table = _io.StringIO()
        stats = _pstats.Stats(profiler, stream=table)
        stats.sort_stats(sort_key).print_stats(limit)
        report = {{
            "total_calls": int(stats.total_calls),
            "total_seconds": float(stats.total_tt),
            "stats": table.getvalue().strip("\n"),
        }}
        print("{PROFILE_MARKER}" + _json.dumps(report))

try:
    _jmcp_profile({code_literal}, "{sort_key}", {PROFILE_ROWS})
finally:
    del _jmcp_profile
"#
    )
}

/// Reads the profile report and removes its marker line from the outputs, so
/// only what the profiled code printed remains.
pub fn take_profile(result: &mut ExecutionResult) -> Option<ProfileReport> {
    let report = parse_marked(result, PROFILE_MARKER).ok();
    result.outputs.retain_mut(|event| match event {
        ResultEvent::Stream {
            name: StreamName::Stdout,
            text,
        } => {
            let kept: String = text
                .split_inclusive('\n')
                .filter(|line| !line.starts_with(PROFILE_MARKER))
                .collect();
            *text = kept;
            !text.is_empty()
        }
        _ => true,
    });
    report
}

/// Case-insensitive match on the type name, e.g. "dataframe" or "list".
pub fn filter_by_type(variables: Vec<VariableSummary>, type_name: &str) -> Vec<VariableSummary> {
    let wanted = type_name.trim();
    variables
        .into_iter()
        .filter(|variable| variable.type_name.eq_ignore_ascii_case(wanted))
        .collect()
}

pub fn parse_namespace(result: &ExecutionResult) -> Result<Vec<VariableSummary>, KernelError> {
    parse_marked(result, NAMESPACE_MARKER)
}

pub fn parse_variable(result: &ExecutionResult) -> Result<VariableDetail, KernelError> {
    parse_marked(result, VARIABLE_MARKER)
}

fn parse_marked<T>(result: &ExecutionResult, marker: &str) -> Result<T, KernelError>
where
    T: serde::de::DeserializeOwned,
{
    let stdout = result.stdout_text();
    let payload = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(marker))
        .ok_or_else(|| {
            KernelError::Protocol("introspection snippet produced no report".to_string())
        })?;
    serde_json::from_str(payload)
        .map_err(|err| KernelError::Protocol(format!("invalid introspection report: {err}")))
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_alphanumeric())
}

/// JSON string literals are valid Python string literals for everything
/// serde_json emits.
fn python_string_or_none(value: Option<&str>) -> String {
    match value {
        Some(text) => serde_json::Value::String(text.to_string()).to_string(),
        None => "None".to_string(),
    }
}
