use rmcp::model::{AnnotateAble, CallToolResult, Content, RawContent, RawImageContent};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::environment::EnvironmentError;
use crate::error::{FailureCategory, KernelError};
use crate::installer::InstallerError;
use crate::kernel_protocol::ExecutionResult;
use crate::notebook::DocumentError;
use crate::notebook_runner::NotebookRunError;

const IMAGE_MIME_TYPES: [&str; 2] = ["image/png", "image/jpeg"];

/// Anything that can be reported as a `{status: "error", ...}` payload.
pub(crate) trait ToolFailure: std::fmt::Display {
    fn category(&self) -> FailureCategory;
    fn remediation(&self) -> Vec<String>;
}

impl ToolFailure for KernelError {
    fn category(&self) -> FailureCategory {
        KernelError::category(self)
    }

    fn remediation(&self) -> Vec<String> {
        KernelError::remediation(self)
    }
}

impl ToolFailure for EnvironmentError {
    fn category(&self) -> FailureCategory {
        FailureCategory::StartupFailure
    }

    fn remediation(&self) -> Vec<String> {
        EnvironmentError::remediation(self)
    }
}

impl ToolFailure for InstallerError {
    fn category(&self) -> FailureCategory {
        match self {
            InstallerError::NoPackages | InstallerError::InvalidSpecifier(_) => {
                FailureCategory::InvalidRequest
            }
            _ => FailureCategory::DependencyFailure,
        }
    }

    fn remediation(&self) -> Vec<String> {
        InstallerError::remediation(self)
    }
}

impl ToolFailure for DocumentError {
    fn category(&self) -> FailureCategory {
        FailureCategory::DocumentError
    }

    fn remediation(&self) -> Vec<String> {
        DocumentError::remediation(self)
    }
}

impl ToolFailure for NotebookRunError {
    fn category(&self) -> FailureCategory {
        NotebookRunError::category(self)
    }

    fn remediation(&self) -> Vec<String> {
        NotebookRunError::remediation(self)
    }
}

pub(crate) fn json_text<T: Serialize>(value: &T) -> Content {
    let text = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}).to_string());
    Content::text(text)
}

pub(crate) fn success<T: Serialize>(value: &T) -> CallToolResult {
    CallToolResult::success(vec![json_text(value)])
}

/// `value` as a JSON object with `status: "ok"` and any warnings added.
pub(crate) fn ok_payload<T: Serialize>(value: &T, warnings: Vec<String>) -> Value {
    let mut payload = match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({ "result": other }),
        Err(err) => json!({ "serialize_error": err.to_string() }),
    };
    payload["status"] = json!("ok");
    if !warnings.is_empty() {
        payload["warnings"] = json!(warnings);
    }
    payload
}

pub(crate) fn failure_payload(
    category: FailureCategory,
    message: impl Into<String>,
    remediation: Vec<String>,
) -> Value {
    json!({
        "status": "error",
        "category": category,
        "message": message.into(),
        "remediation": remediation,
    })
}

pub(crate) fn failure(err: &dyn ToolFailure) -> CallToolResult {
    failure_with(err, Vec::new())
}

pub(crate) fn failure_with(err: &dyn ToolFailure, warnings: Vec<String>) -> CallToolResult {
    let mut payload = failure_payload(err.category(), err.to_string(), err.remediation());
    if !warnings.is_empty() {
        payload["warnings"] = json!(warnings);
    }
    CallToolResult::error(vec![json_text(&payload)])
}

pub(crate) fn invalid_request(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![json_text(&failure_payload(
        FailureCategory::InvalidRequest,
        message,
        Vec::new(),
    ))])
}

/// Result payload for an execution. User exceptions stay a normal result;
/// timeouts and dead kernels are tool errors.
pub(crate) fn execution_result(
    result: &ExecutionResult,
    session_id: Option<&str>,
    warnings: Vec<String>,
) -> CallToolResult {
    execution_result_with(result, session_id, warnings, Map::new())
}

/// Like [`execution_result`], with `extra` fields merged into the payload.
pub(crate) fn execution_result_with(
    result: &ExecutionResult,
    session_id: Option<&str>,
    warnings: Vec<String>,
    extra: Map<String, Value>,
) -> CallToolResult {
    let mut payload = serde_json::to_value(result)
        .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
    if let Some(object) = payload.as_object_mut() {
        object.extend(extra);
    }
    let status = match result.failure.as_ref() {
        Some(failure) => {
            payload["category"] = json!(failure.category);
            payload["message"] = json!(failure.message);
            "error"
        }
        None if result.has_error => {
            payload["category"] = json!(FailureCategory::ExecutionError);
            "ok"
        }
        None => "ok",
    };
    payload["status"] = json!(status);
    if let Some(session_id) = session_id {
        payload["session_id"] = json!(session_id);
    }
    if !warnings.is_empty() {
        payload["warnings"] = json!(warnings);
    }
    let images = strip_images(&mut payload);

    let mut contents = vec![json_text(&payload)];
    contents.extend(
        images
            .into_iter()
            .map(|(data, mime_type)| image_content(data, mime_type)),
    );
    if result.failure.is_some() {
        CallToolResult::error(contents)
    } else {
        CallToolResult::success(contents)
    }
}

/// Replaces base64 image data in the JSON text with a placeholder and returns
/// the images for separate attachment, in output order.
fn strip_images(payload: &mut Value) -> Vec<(String, String)> {
    let mut images = Vec::new();
    let Some(outputs) = payload.get_mut("outputs").and_then(Value::as_array_mut) else {
        return images;
    };
    for output in outputs {
        let Some(data) = output.get_mut("data").and_then(Value::as_object_mut) else {
            continue;
        };
        for mime in IMAGE_MIME_TYPES {
            if let Some(Value::String(encoded)) = data.get_mut(mime) {
                let encoded = std::mem::replace(encoded, format!("<{mime} attached>"));
                images.push((encoded, mime.to_string()));
            }
        }
    }
    images
}

fn image_content(data: String, mime_type: String) -> Content {
    RawContent::Image(RawImageContent {
        data,
        mime_type,
        meta: None,
    })
    .no_annotation()
}
