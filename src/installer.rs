use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::classify::package_for_import;
use crate::environment::{
    self, EnvironmentDescriptor, EnvironmentError, PROBE_TIMEOUT, TOOL_TIMEOUT, UV_INSTALL_HINT,
};
use crate::event_log;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("no packages requested")]
    NoPackages,
    #[error("invalid package specifier: {0:?}")]
    InvalidSpecifier(String),
    #[error("no pyproject.toml in {}; uv sync needs a project", .0.display())]
    NoProject(PathBuf),
    #[error("could not read installed packages: {0}")]
    InvalidListing(String),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

impl InstallerError {
    pub fn remediation(&self) -> Vec<String> {
        match self {
            InstallerError::NoPackages | InstallerError::InvalidSpecifier(_) => {
                vec!["Pass package names such as \"pandas\" or \"numpy>=1.26\"".to_string()]
            }
            InstallerError::NoProject(_) => vec![
                "Create a project with: uv init".to_string(),
                "Or install individual packages with jupyter_ensure_dependencies".to_string(),
            ],
            InstallerError::InvalidListing(_) => {
                vec!["Check that the environment's interpreter runs (jupyter_validate_setup)".to_string()]
            }
            InstallerError::Environment(err) => err.remediation(),
        }
    }
}

/// The managed tool that mutates an environment. Only `uv` is implemented;
/// tests substitute a scripted manager.
pub trait PackageManager {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Installed distributions keyed by normalized name, with versions.
    fn installed_packages(
        &self,
        environment: &EnvironmentDescriptor,
    ) -> Result<BTreeMap<String, String>, InstallerError>;

    fn add(
        &self,
        environment: &EnvironmentDescriptor,
        project_root: &Path,
        specifiers: &[String],
        dev: bool,
    ) -> Result<(), InstallerError>;

    fn sync(
        &self,
        environment: &EnvironmentDescriptor,
        project_root: &Path,
        upgrade: bool,
    ) -> Result<(), InstallerError>;
}

pub struct UvPackageManager {
    program: Option<PathBuf>,
}

impl UvPackageManager {
    pub fn from_env() -> Self {
        Self {
            program: environment::uv_program(),
        }
    }

    fn command(&self) -> Result<Command, InstallerError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| EnvironmentError::ToolNotInstalled {
                tool: "uv".to_string(),
            })?;
        Ok(Command::new(program))
    }

    fn run(&self, mut command: Command, timeout: std::time::Duration) -> Result<String, InstallerError> {
        let label = environment::describe_command(&command);
        command.env_remove("PYTHONHOME");
        let output = environment::run_with_timeout(command, timeout)?;
        event_log::log(
            "installer_command",
            json!({
                "command": label,
                "status": output.status.code(),
            }),
        );
        if !output.status.success() {
            return Err(EnvironmentError::CommandFailed {
                command: label,
                detail: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }
}

#[derive(Deserialize)]
struct ListedPackage {
    name: String,
    version: String,
}

impl PackageManager for UvPackageManager {
    fn name(&self) -> &str {
        "uv"
    }

    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn installed_packages(
        &self,
        environment: &EnvironmentDescriptor,
    ) -> Result<BTreeMap<String, String>, InstallerError> {
        let mut command = self.command()?;
        command
            .args(["pip", "list", "--format", "json", "--python"])
            .arg(&environment.python);
        let stdout = self.run(command, PROBE_TIMEOUT)?;
        let listed: Vec<ListedPackage> = serde_json::from_str(stdout.trim())
            .map_err(|err| InstallerError::InvalidListing(err.to_string()))?;
        Ok(listed
            .into_iter()
            .map(|package| (normalize_name(&package.name), package.version))
            .collect())
    }

    fn add(
        &self,
        environment: &EnvironmentDescriptor,
        project_root: &Path,
        specifiers: &[String],
        dev: bool,
    ) -> Result<(), InstallerError> {
        let mut command = self.command()?;
        command.current_dir(project_root);
        if project_root.join("pyproject.toml").is_file() {
            command.arg("add");
            if dev {
                command.arg("--dev");
            }
            command.env("VIRTUAL_ENV", &environment.root);
        } else {
            command
                .args(["pip", "install", "--python"])
                .arg(&environment.python);
        }
        command.args(specifiers);
        self.run(command, TOOL_TIMEOUT).map(|_| ())
    }

    fn sync(
        &self,
        environment: &EnvironmentDescriptor,
        project_root: &Path,
        upgrade: bool,
    ) -> Result<(), InstallerError> {
        if !project_root.join("pyproject.toml").is_file() {
            return Err(InstallerError::NoProject(project_root.to_path_buf()));
        }
        let mut command = self.command()?;
        command
            .current_dir(project_root)
            .arg("sync")
            .env("VIRTUAL_ENV", &environment.root);
        if upgrade {
            command.arg("--upgrade");
        }
        self.run(command, TOOL_TIMEOUT).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PackageStatus {
    Installed {
        version: Option<String>,
        /// Version that was present but did not meet the requirement.
        #[serde(skip_serializing_if = "Option::is_none")]
        replaced: Option<String>,
    },
    AlreadyPresent {
        version: String,
    },
    Failed {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageOutcome {
    pub package: String,
    #[serde(flatten)]
    pub status: PackageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsureReport {
    pub success: bool,
    pub manager: String,
    pub packages: Vec<PackageOutcome>,
}

impl EnsureReport {
    pub fn failed_count(&self) -> usize {
        self.packages
            .iter()
            .filter(|outcome| matches!(outcome.status, PackageStatus::Failed { .. }))
            .count()
    }
}

/// Installs whichever of `specifiers` are missing or installed at a version the
/// requirement excludes. Nothing is invoked when every package is already
/// satisfied, and no fallback installer is ever used.
pub fn ensure(
    manager: &dyn PackageManager,
    environment: &EnvironmentDescriptor,
    project_root: &Path,
    specifiers: &[String],
    dev: bool,
) -> Result<EnsureReport, InstallerError> {
    let requested: Vec<(String, String)> = specifiers
        .iter()
        .map(|spec| spec.trim())
        .filter(|spec| !spec.is_empty())
        .map(|spec| {
            let name = requirement_name(spec)
                .ok_or_else(|| InstallerError::InvalidSpecifier(spec.to_string()))?;
            Ok::<_, InstallerError>((spec.to_string(), name))
        })
        .collect::<Result<_, InstallerError>>()?;
    if requested.is_empty() {
        return Err(InstallerError::NoPackages);
    }

    if !manager.is_available() {
        let reason = format!("{} is not installed or not on PATH", manager.name());
        let packages = requested
            .into_iter()
            .map(|(spec, _)| PackageOutcome {
                package: spec,
                status: PackageStatus::Failed {
                    reason: reason.clone(),
                    suggestion: Some(UV_INSTALL_HINT.to_string()),
                },
            })
            .collect();
        return Ok(EnsureReport {
            success: false,
            manager: manager.name().to_string(),
            packages,
        });
    }

    let installed = manager.installed_packages(environment)?;
    let satisfied = |spec: &str, name: &str| {
        installed
            .get(name)
            .is_some_and(|version| version_satisfies(spec, version) == Some(true))
    };
    let missing: Vec<String> = requested
        .iter()
        .filter(|(spec, name)| !satisfied(spec.as_str(), name.as_str()))
        .map(|(spec, _)| spec.clone())
        .collect();

    let install_error = if missing.is_empty() {
        None
    } else {
        event_log::log(
            "installer_add",
            json!({ "packages": missing, "dev": dev, "manager": manager.name() }),
        );
        manager
            .add(environment, project_root, &missing, dev)
            .err()
            .map(|err| err.to_string())
    };
    let after = match (&install_error, missing.is_empty()) {
        (None, false) => manager.installed_packages(environment)?,
        _ => BTreeMap::new(),
    };

    let packages = requested
        .into_iter()
        .map(|(spec, name)| {
            let previous = installed.get(&name).cloned();
            let status = if satisfied(spec.as_str(), name.as_str()) {
                PackageStatus::AlreadyPresent {
                    version: previous.unwrap_or_default(),
                }
            } else if let Some(reason) = install_error.as_ref() {
                PackageStatus::Failed {
                    reason: reason.clone(),
                    suggestion: suggestion_for(&name),
                }
            } else if let Some(version) = after.get(&name) {
                PackageStatus::Installed {
                    version: Some(version.clone()),
                    replaced: previous,
                }
            } else {
                PackageStatus::Failed {
                    reason: format!("{name} is not installed after running {}", manager.name()),
                    suggestion: suggestion_for(&name),
                }
            };
            PackageOutcome {
                package: spec,
                status,
            }
        })
        .collect::<Vec<_>>();

    let success = packages
        .iter()
        .all(|outcome| !matches!(outcome.status, PackageStatus::Failed { .. }));
    Ok(EnsureReport {
        success,
        manager: manager.name().to_string(),
        packages,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionChange {
    pub name: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<VersionChange>,
    pub kernel_restart_required: bool,
}

/// `uv sync`, reporting what changed in the environment.
pub fn sync(
    manager: &dyn PackageManager,
    environment: &EnvironmentDescriptor,
    project_root: &Path,
    upgrade: bool,
) -> Result<SyncReport, InstallerError> {
    if !manager.is_available() {
        return Err(EnvironmentError::ToolNotInstalled {
            tool: manager.name().to_string(),
        }
        .into());
    }
    let before = manager.installed_packages(environment).unwrap_or_default();
    manager.sync(environment, project_root, upgrade)?;
    let after = manager.installed_packages(environment)?;
    Ok(diff_packages(&before, &after))
}

fn diff_packages(before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) -> SyncReport {
    let added: Vec<String> = after
        .keys()
        .filter(|name| !before.contains_key(*name))
        .cloned()
        .collect();
    let removed: Vec<String> = before
        .keys()
        .filter(|name| !after.contains_key(*name))
        .cloned()
        .collect();
    let changed: Vec<VersionChange> = after
        .iter()
        .filter_map(|(name, version)| {
            let old = before.get(name)?;
            (old != version).then(|| VersionChange {
                name: name.clone(),
                from: old.clone(),
                to: version.clone(),
            })
        })
        .collect();
    // Added packages import fine in a running kernel; replaced ones do not.
    let kernel_restart_required = !removed.is_empty() || !changed.is_empty();
    SyncReport {
        added,
        removed,
        changed,
        kernel_restart_required,
    }
}

/// PEP 503 name normalization.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_was_separator {
                normalized.push('-');
            }
            last_was_separator = true;
        } else {
            normalized.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        }
    }
    normalized
}

/// Distribution name of a requirement, without extras, version or markers.
pub fn requirement_name(spec: &str) -> Option<String> {
    let end = spec
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    let name = &spec[..end];
    if name.is_empty() {
        return None;
    }
    Some(normalize_name(name))
}

/// Whether `installed` meets the version clauses of `spec`. `None` when the
/// requirement uses a form this check does not model (direct URLs, epochs,
/// local versions); those are passed to the package manager to decide.
/// Pre-release tags are ignored, so `2.0.0rc1` compares as `2.0.0`.
pub fn version_satisfies(spec: &str, installed: &str) -> Option<bool> {
    let requirement = spec.split(';').next().unwrap_or(spec);
    if requirement.contains('@') {
        return None;
    }
    let name_end = requirement
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
        .unwrap_or(requirement.len());
    let mut clauses = requirement[name_end..].trim_start();
    if let Some(extras) = clauses.strip_prefix('[') {
        clauses = extras.split_once(']')?.1;
    }
    let clauses = clauses
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();
    if clauses.is_empty() {
        return Some(true);
    }
    let installed = release_segments(installed)?;
    for clause in clauses.split(',') {
        if !clause_holds(clause.trim(), &installed)? {
            return Some(false);
        }
    }
    Some(true)
}

fn clause_holds(clause: &str, installed: &[u64]) -> Option<bool> {
    let (operator, version) = ["===", "==", "!=", "~=", ">=", "<=", ">", "<"]
        .iter()
        .find_map(|operator| {
            clause
                .strip_prefix(operator)
                .map(|version| (*operator, version.trim()))
        })?;
    if let Some(prefix) = version.strip_suffix(".*") {
        let matched = has_prefix(installed, &release_segments(prefix)?);
        return match operator {
            "==" => Some(matched),
            "!=" => Some(!matched),
            _ => None,
        };
    }
    let wanted = release_segments(version)?;
    let ordering = compare_releases(installed, &wanted);
    Some(match operator {
        "==" | "===" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        "~=" if wanted.len() >= 2 => {
            ordering != Ordering::Less && has_prefix(installed, &wanted[..wanted.len() - 1])
        }
        _ => return None,
    })
}

/// Numeric release part of a version: `1.26.4` -> `[1, 26, 4]`.
fn release_segments(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches('v');
    if version.contains('!') || version.contains('+') {
        return None;
    }
    let end = version
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(version.len());
    let release = version[..end].trim_end_matches('.');
    if release.is_empty() {
        return None;
    }
    release
        .split('.')
        .map(|segment| segment.parse().ok())
        .collect()
}

fn compare_releases(left: &[u64], right: &[u64]) -> Ordering {
    let len = left.len().max(right.len());
    (0..len)
        .map(|index| {
            let a = left.get(index).copied().unwrap_or(0);
            let b = right.get(index).copied().unwrap_or(0);
            a.cmp(&b)
        })
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn has_prefix(version: &[u64], prefix: &[u64]) -> bool {
    prefix
        .iter()
        .enumerate()
        .all(|(index, segment)| version.get(index).copied().unwrap_or(0) == *segment)
}

fn suggestion_for(name: &str) -> Option<String> {
    let distribution = package_for_import(name);
    if !distribution.eq_ignore_ascii_case(name) {
        return Some(format!(
            "'{name}' is an import name; the package is published as '{distribution}'"
        ));
    }
    Some(format!("Check that '{name}' is the correct package name on PyPI"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedManager {
        available: bool,
        installed: RefCell<BTreeMap<String, String>>,
        installs_succeed: bool,
        add_calls: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedManager {
        fn with_installed(pairs: &[(&str, &str)]) -> Self {
            Self {
                available: true,
                installed: RefCell::new(
                    pairs
                        .iter()
                        .map(|(name, version)| (name.to_string(), version.to_string()))
                        .collect(),
                ),
                installs_succeed: true,
                add_calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PackageManager for ScriptedManager {
        fn name(&self) -> &str {
            "uv"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn installed_packages(
            &self,
            _environment: &EnvironmentDescriptor,
        ) -> Result<BTreeMap<String, String>, InstallerError> {
            Ok(self.installed.borrow().clone())
        }

        fn add(
            &self,
            _environment: &EnvironmentDescriptor,
            _project_root: &Path,
            specifiers: &[String],
            _dev: bool,
        ) -> Result<(), InstallerError> {
            self.add_calls.borrow_mut().push(specifiers.to_vec());
            if !self.installs_succeed {
                return Err(EnvironmentError::CommandFailed {
                    command: "uv add".to_string(),
                    detail: "No solution found".to_string(),
                }
                .into());
            }
            let mut installed = self.installed.borrow_mut();
            for spec in specifiers {
                if let Some(name) = requirement_name(spec) {
                    installed.insert(name, "1.0.0".to_string());
                }
            }
            Ok(())
        }

        fn sync(
            &self,
            _environment: &EnvironmentDescriptor,
            _project_root: &Path,
            _upgrade: bool,
        ) -> Result<(), InstallerError> {
            let mut installed = self.installed.borrow_mut();
            installed.insert("requests".to_string(), "2.32.0".to_string());
            installed.insert("numpy".to_string(), "2.1.0".to_string());
            Ok(())
        }
    }

    fn environment() -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            root: PathBuf::from("/proj/.venv"),
            python: PathBuf::from("/proj/.venv/bin/python"),
            provenance: crate::environment::Provenance::ManagedTool,
            priority: 1,
            name: None,
            python_version: None,
        }
    }

    fn specs(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn present_packages_skip_the_installer() {
        let manager = ScriptedManager::with_installed(&[("pandas", "2.2.2")]);
        let report = ensure(&manager, &environment(), Path::new("/proj"), &specs(&["Pandas"]), false)
            .expect("ensure");
        assert!(report.success);
        assert_eq!(
            report.packages[0].status,
            PackageStatus::AlreadyPresent {
                version: "2.2.2".to_string()
            }
        );
        assert!(manager.add_calls.borrow().is_empty());
    }

    #[test]
    fn only_missing_packages_are_installed() {
        let manager = ScriptedManager::with_installed(&[("numpy", "2.0.0")]);
        let report = ensure(
            &manager,
            &environment(),
            Path::new("/proj"),
            &specs(&["numpy", "scikit_learn[alldeps]>=1.4"]),
            true,
        )
        .expect("ensure");
        assert_eq!(
            *manager.add_calls.borrow(),
            vec![specs(&["scikit_learn[alldeps]>=1.4"])]
        );
        assert_eq!(
            report.packages[1].status,
            PackageStatus::Installed {
                version: Some("1.0.0".to_string()),
                replaced: None,
            }
        );
        assert_eq!(report.failed_count(), 0);
    }

    #[test]
    fn installed_version_outside_the_requirement_is_replaced() {
        let manager = ScriptedManager::with_installed(&[("numpy", "1.26.4"), ("pandas", "2.2.2")]);
        let report = ensure(
            &manager,
            &environment(),
            Path::new("/proj"),
            &specs(&["numpy>=2", "pandas>=2.1,<3"]),
            false,
        )
        .expect("ensure");
        assert_eq!(*manager.add_calls.borrow(), vec![specs(&["numpy>=2"])]);
        assert_eq!(
            report.packages[0].status,
            PackageStatus::Installed {
                version: Some("1.0.0".to_string()),
                replaced: Some("1.26.4".to_string()),
            }
        );
        assert_eq!(
            report.packages[1].status,
            PackageStatus::AlreadyPresent {
                version: "2.2.2".to_string()
            }
        );
    }

    #[test]
    fn version_clauses_follow_pep_440_release_ordering() {
        assert_eq!(version_satisfies("numpy", "1.0"), Some(true));
        assert_eq!(version_satisfies("numpy>=2", "1.26.4"), Some(false));
        assert_eq!(version_satisfies("numpy>=2", "2.0"), Some(true));
        assert_eq!(version_satisfies("numpy==2.0", "2.0.0"), Some(true));
        assert_eq!(version_satisfies("numpy==1.*", "1.26.4"), Some(true));
        assert_eq!(version_satisfies("numpy!=1.26.4", "1.26.4"), Some(false));
        assert_eq!(version_satisfies("requests~=2.31", "2.32.3"), Some(true));
        assert_eq!(version_satisfies("requests~=2.31.0", "2.32.3"), Some(false));
        assert_eq!(version_satisfies("scikit_learn[alldeps] (>=1.4)", "1.5.0"), Some(true));
        assert_eq!(version_satisfies("tomli<2; python_version<'3.11'", "2.0.1"), Some(false));
        assert_eq!(version_satisfies("torch @ https://example.invalid/t.whl", "2.3.0"), None);
        assert_eq!(version_satisfies("numpy>=2", "2.0.0+cpu"), None);
    }

    #[test]
    fn failed_install_reports_reason_and_distribution_hint() {
        let mut manager = ScriptedManager::with_installed(&[]);
        manager.installs_succeed = false;
        let report = ensure(&manager, &environment(), Path::new("/proj"), &specs(&["sklearn"]), false)
            .expect("ensure");
        assert!(!report.success);
        match &report.packages[0].status {
            PackageStatus::Failed { reason, suggestion } => {
                assert!(reason.contains("No solution found"), "{reason}");
                assert!(
                    suggestion.as_deref().is_some_and(|hint| hint.contains("scikit-learn")),
                    "{suggestion:?}"
                );
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_manager_fails_without_fallback() {
        let mut manager = ScriptedManager::with_installed(&[]);
        manager.available = false;
        let report = ensure(&manager, &environment(), Path::new("/proj"), &specs(&["rich"]), false)
            .expect("ensure");
        assert!(!report.success);
        assert_eq!(report.failed_count(), 1);
        assert!(manager.add_calls.borrow().is_empty());
    }

    #[test]
    fn rejects_empty_and_malformed_requests() {
        let manager = ScriptedManager::with_installed(&[]);
        assert!(matches!(
            ensure(&manager, &environment(), Path::new("/proj"), &specs(&[" "]), false),
            Err(InstallerError::NoPackages)
        ));
        assert!(matches!(
            ensure(&manager, &environment(), Path::new("/proj"), &specs(&[">=1.0"]), false),
            Err(InstallerError::InvalidSpecifier(_))
        ));
    }

    #[test]
    fn sync_diff_flags_restart_only_for_replacements() {
        let manager = ScriptedManager::with_installed(&[("numpy", "2.0.0")]);
        let report = sync(&manager, &environment(), Path::new("/proj"), false).expect("sync");
        assert_eq!(report.added, vec!["requests".to_string()]);
        assert_eq!(
            report.changed,
            vec![VersionChange {
                name: "numpy".to_string(),
                from: "2.0.0".to_string(),
                to: "2.1.0".to_string(),
            }]
        );
        assert!(report.kernel_restart_required);
    }

    #[test]
    fn names_follow_pep_503() {
        assert_eq!(normalize_name("Foo__Bar.baz"), "foo-bar-baz");
        assert_eq!(requirement_name("typing_extensions>=4; python_version<'3.11'").as_deref(), Some("typing-extensions"));
        assert_eq!(requirement_name("torch @ https://example.invalid/t.whl").as_deref(), Some("torch"));
    }
}
