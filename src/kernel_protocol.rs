use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::ErrorClassification;
use crate::error::FailureCategory;

/// MIME type to representation, as produced by the interpreter's display machinery.
pub type MimeBundle = BTreeMap<String, Value>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

/// One output of an execution. The idle marker never appears here; it only
/// terminates the drain loop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum ResultEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
        execution_count: u64,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// A message kind this server does not model, kept verbatim.
    Other { msg_type: String, content: Value },
}

impl ResultEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        ResultEvent::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        ResultEvent::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultEvent::Error { .. })
    }
}

/// Control-plane failure that cut an execution short.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub category: FailureCategory,
    pub message: String,
    /// Session state after the failure was handled (`ready` or `dead`).
    pub kernel_state: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct ExecutionResult {
    pub execution_count: u64,
    pub outputs: Vec<ResultEvent>,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    #[serde(skip_serializing_if = "is_zero")]
    pub skipped_messages: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl ExecutionResult {
    /// Concatenated stdout text, in emission order.
    pub fn stdout_text(&self) -> String {
        self.outputs
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Stream {
                    name: StreamName::Stdout,
                    text,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn first_error(&self) -> Option<(&str, &str, &[String])> {
        self.outputs.iter().find_map(|event| match event {
            ResultEvent::Error {
                ename,
                evalue,
                traceback,
            } => Some((ename.as_str(), evalue.as_str(), traceback.as_slice())),
            _ => None,
        })
    }

    pub fn timed_out(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|failure| failure.category == FailureCategory::Timeout)
    }
}
