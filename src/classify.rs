use std::sync::OnceLock;
use std::time::Duration;

use regex_lite::Regex;
use serde::Serialize;

/// Import names whose distribution is published under a different name.
const IMPORT_TO_PACKAGE: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("PIL", "pillow"),
    ("Image", "pillow"),
    ("yaml", "pyyaml"),
    ("dotenv", "python-dotenv"),
    ("bs4", "beautifulsoup4"),
    ("wx", "wxpython"),
    ("OpenSSL", "pyopenssl"),
    ("dateutil", "python-dateutil"),
    ("skimage", "scikit-image"),
    ("attr", "attrs"),
    ("Crypto", "pycryptodome"),
    ("serial", "pyserial"),
    ("jwt", "pyjwt"),
    ("docx", "python-docx"),
    ("magic", "python-magic"),
];

pub fn package_for_import(import_name: &str) -> &str {
    let top_level = import_name.split('.').next().unwrap_or(import_name);
    IMPORT_TO_PACKAGE
        .iter()
        .find(|(import, _)| *import == top_level)
        .map(|(_, package)| *package)
        .unwrap_or(top_level)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingModule,
    ImportFailure,
    FileNotFound,
    UndefinedName,
    MissingAttribute,
    TypeMismatch,
    InvalidValue,
    Syntax,
    Indentation,
    MissingKey,
    IndexOutOfRange,
    OutOfMemory,
    Runtime,
    Unknown,
}

impl ErrorCategory {
    fn from_exception(ename: &str) -> Self {
        match ename {
            "ModuleNotFoundError" => ErrorCategory::MissingModule,
            "ImportError" => ErrorCategory::ImportFailure,
            "FileNotFoundError" => ErrorCategory::FileNotFound,
            "NameError" | "UnboundLocalError" => ErrorCategory::UndefinedName,
            "AttributeError" => ErrorCategory::MissingAttribute,
            "TypeError" => ErrorCategory::TypeMismatch,
            "ValueError" => ErrorCategory::InvalidValue,
            "SyntaxError" => ErrorCategory::Syntax,
            "IndentationError" | "TabError" => ErrorCategory::Indentation,
            "KeyError" => ErrorCategory::MissingKey,
            "IndexError" => ErrorCategory::IndexOutOfRange,
            "MemoryError" => ErrorCategory::OutOfMemory,
            "RuntimeError" | "RecursionError" => ErrorCategory::Runtime,
            _ => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undefined_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLocation {
    pub file: String,
    pub line: u32,
}

/// What the calling agent should do next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentGuidance {
    pub should_retry: bool,
    pub next_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub explanation_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub exception: String,
    pub category: ErrorCategory,
    pub fields: ExtractedFields,
    pub remediation: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    pub location: Option<ErrorLocation>,
    pub guidance: AgentGuidance,
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("failed to compile classifier regex"))
}

fn capture_one(cell: &'static OnceLock<Regex>, pattern: &str, text: &str) -> Option<String> {
    let (_, [value]) = regex(cell, pattern).captures(text)?.extract();
    Some(value.to_string())
}

fn strip_ansi(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\x1b\[[0-9;]*[A-Za-z]")
        .replace_all(text, "")
        .into_owned()
}

/// Last `File "...", line N` frame in the traceback.
pub fn error_location(traceback: &[String]) -> Option<ErrorLocation> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r#"File "([^"]+)", line (\d+)"#);
    traceback.iter().rev().find_map(|chunk| {
        let clean = strip_ansi(chunk);
        let (_, [file, line]) = re.captures_iter(&clean).last()?.extract();
        Some(ErrorLocation {
            file: file.to_string(),
            line: line.parse().ok()?,
        })
    })
}

/// Total over its input: unrecognized exception names fall back to `unknown`.
pub fn classify(ename: &str, evalue: &str, traceback: &[String]) -> ErrorClassification {
    let category = ErrorCategory::from_exception(ename);
    let mut fields = ExtractedFields::default();
    let mut commands = Vec::new();
    let remediation: Vec<String> = match category {
        ErrorCategory::MissingModule => {
            static RE: OnceLock<Regex> = OnceLock::new();
            let module = capture_one(&RE, r"No module named '([^']+)'", evalue)
                .unwrap_or_else(|| "unknown".to_string());
            let package = package_for_import(&module).to_string();
            commands.push(format!("uv add {package}"));
            commands.push("uv sync".to_string());
            let hints = vec![
                format!("Install the missing package with jupyter_ensure_dependencies: {package}"),
                format!("From a shell: uv add {package}"),
                "Check that the kernel runs in the project's environment".to_string(),
                "Run 'uv sync' if the package is already in uv.lock".to_string(),
            ];
            fields.module = Some(module);
            fields.package = Some(package);
            hints
        }
        ErrorCategory::ImportFailure => {
            static RE: OnceLock<Regex> = OnceLock::new();
            match capture_one(&RE, r"cannot import name '([^']+)'", evalue) {
                Some(name) => {
                    let hints = vec![
                        format!("Check that '{name}' exists in the module"),
                        "Verify the import path".to_string(),
                        "The installed version may have a different API".to_string(),
                    ];
                    fields.import_name = Some(name);
                    hints
                }
                None => {
                    commands.push("uv sync".to_string());
                    vec![
                        "Check that the module is installed in the kernel's environment".to_string(),
                        "Run 'uv sync' to install the locked dependencies".to_string(),
                    ]
                }
            }
        }
        ErrorCategory::FileNotFound => {
            static RE: OnceLock<Regex> = OnceLock::new();
            let path = capture_one(&RE, r#"['"]([^'"]+)['"]"#, evalue)
                .unwrap_or_else(|| "unknown".to_string());
            commands.push("import os; os.getcwd()".to_string());
            commands.push(format!("from pathlib import Path; Path('{path}').exists()"));
            let hints = vec![
                format!("Check that the file exists: {path}"),
                "Relative paths resolve against the kernel's working directory".to_string(),
                "Use an absolute path or create the file first".to_string(),
            ];
            fields.file_path = Some(path);
            hints
        }
        ErrorCategory::UndefinedName => {
            static RE: OnceLock<Regex> = OnceLock::new();
            let name = capture_one(&RE, r"name '([^']+)' is not defined", evalue)
                .or_else(|| {
                    static LOCAL_RE: OnceLock<Regex> = OnceLock::new();
                    capture_one(&LOCAL_RE, r"local variable '([^']+)'", evalue)
                })
                .unwrap_or_else(|| "unknown".to_string());
            let hints = vec![
                format!("'{name}' is not defined in the kernel namespace"),
                "Check the spelling, or define it before use".to_string(),
                "Re-run the cell that defines it; state is lost after a restart".to_string(),
                "Import the module if it is a function or class".to_string(),
            ];
            fields.undefined_name = Some(name);
            hints
        }
        ErrorCategory::MissingAttribute => {
            static RE: OnceLock<Regex> = OnceLock::new();
            let re = regex(&RE, r"'([^']+)' object has no attribute '([^']+)'");
            match re.captures(evalue).map(|caps| caps.extract()) {
                Some((_, [object_type, attribute])) => {
                    commands.push("dir(obj)".to_string());
                    commands.push("type(obj)".to_string());
                    let hints = vec![
                        format!("'{object_type}' objects have no attribute '{attribute}'"),
                        "Check the attribute name for typos".to_string(),
                        "Use dir() to list available attributes".to_string(),
                        "The object may be None or of an unexpected type".to_string(),
                    ];
                    fields.object_type = Some(object_type.to_string());
                    fields.attribute = Some(attribute.to_string());
                    hints
                }
                None => vec![
                    "The object does not have the requested attribute".to_string(),
                    "Check the object's type and available methods".to_string(),
                ],
            }
        }
        ErrorCategory::TypeMismatch => {
            commands.push("type(variable)".to_string());
            vec![
                "Check the types of the values involved".to_string(),
                "Check the function signature and required arguments".to_string(),
                "Convert values explicitly where needed".to_string(),
            ]
        }
        ErrorCategory::InvalidValue => vec![
            "The value is invalid for this operation".to_string(),
            "Check the data format and ranges".to_string(),
            "Validate input before processing".to_string(),
        ],
        ErrorCategory::Syntax => vec![
            "Fix the syntax error at the reported line".to_string(),
            "Look for missing colons, parentheses or quotes".to_string(),
            "Check Python version compatibility of the syntax used".to_string(),
        ],
        ErrorCategory::Indentation => vec![
            "Fix the indentation; use 4 spaces per level".to_string(),
            "Do not mix tabs and spaces".to_string(),
        ],
        ErrorCategory::MissingKey => {
            let key = evalue.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
            commands.push("mapping.keys()".to_string());
            commands.push(format!("mapping.get('{key}', default)"));
            let hints = vec![
                format!("Key '{key}' is not present"),
                "List the available keys with .keys()".to_string(),
                "Use .get() with a default for optional keys".to_string(),
            ];
            fields.missing_key = Some(key);
            hints
        }
        ErrorCategory::IndexOutOfRange => {
            commands.push("len(sequence)".to_string());
            vec![
                "The index is out of range".to_string(),
                "Check the sequence length before indexing".to_string(),
            ]
        }
        ErrorCategory::OutOfMemory => {
            commands.push("import gc; gc.collect()".to_string());
            vec![
                "The kernel ran out of memory".to_string(),
                "Process the data in smaller chunks or sample it".to_string(),
                "Delete large variables that are no longer needed".to_string(),
            ]
        }
        ErrorCategory::Runtime => vec![
            "Check for unbounded recursion".to_string(),
            "Verify the environment setup for the library that raised it".to_string(),
        ],
        ErrorCategory::Unknown => vec![
            format!("{ename} was raised; read the message and traceback for details"),
            "Inspect the variables involved with jupyter_inspect_namespace".to_string(),
        ],
    };

    let guidance = guidance_for(category, &fields);
    ErrorClassification {
        exception: ename.to_string(),
        category,
        fields,
        remediation,
        commands,
        location: error_location(traceback),
        guidance,
    }
}

fn guidance_for(category: ErrorCategory, fields: &ExtractedFields) -> AgentGuidance {
    match category {
        ErrorCategory::MissingModule => AgentGuidance {
            should_retry: true,
            next_tool: Some("jupyter_ensure_dependencies".to_string()),
            action: Some(format!(
                "Use jupyter_ensure_dependencies to install {}",
                fields.package.as_deref().unwrap_or("the missing package")
            )),
            explanation_needed: false,
        },
        ErrorCategory::FileNotFound => AgentGuidance {
            explanation_needed: true,
            action: Some("Check that the file exists and verify the path".to_string()),
            ..AgentGuidance::default()
        },
        ErrorCategory::UndefinedName => AgentGuidance {
            should_retry: true,
            action: Some("Define the variable or import the required module".to_string()),
            ..AgentGuidance::default()
        },
        ErrorCategory::Syntax | ErrorCategory::Indentation => AgentGuidance {
            should_retry: true,
            action: Some("Fix the code and execute it again".to_string()),
            ..AgentGuidance::default()
        },
        _ => AgentGuidance::default(),
    }
}

pub fn timeout_remediation(timeout: Duration) -> Vec<String> {
    vec![
        format!(
            "The code did not finish within {} s; pass a larger timeout if it is expected to be slow",
            timeout.as_secs_f64()
        ),
        "Check jupyter_kernel_status; a busy kernel is still running the code".to_string(),
        "Restart with jupyter_restart_kernel to abandon the running code".to_string(),
    ]
}

pub fn process_died_remediation() -> Vec<String> {
    vec![
        "The kernel process exited; in-memory state was lost".to_string(),
        "The next execution starts a fresh kernel, or call jupyter_restart_kernel".to_string(),
        "Large allocations can get the process killed; work on smaller chunks".to_string(),
    ]
}
