//! Package management — npm, yarn and pnpm behind one set of operations.
//!
//! `detect` picks the manager for a project directory, `command` maps a
//! logical operation to that manager's argv, and `service` runs it through
//! the process executor and classifies the outcome.

pub mod command;
pub mod detect;
pub mod service;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{GatewayError, Result};
use crate::registry::{make_tool, Registry};

/// The three supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerIdentity {
    Npm,
    Yarn,
    Pnpm,
}

impl ManagerIdentity {
    pub const ALL: [ManagerIdentity; 3] = [Self::Npm, Self::Yarn, Self::Pnpm];

    /// Executable name
    pub fn executable(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "npm" => Some(Self::Npm),
            "yarn" => Some(Self::Yarn),
            "pnpm" => Some(Self::Pnpm),
            _ => None,
        }
    }
}

impl fmt::Display for ManagerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.executable())
    }
}

/// Manager-bound operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOperation {
    Install,
    Update,
    Remove,
    Audit,
    Outdated,
    CleanCache,
}

impl LogicalOperation {
    pub const ALL: [LogicalOperation; 6] = [
        Self::Install,
        Self::Update,
        Self::Remove,
        Self::Audit,
        Self::Outdated,
        Self::CleanCache,
    ];

    /// Operations whose CLIs exit non-zero to say "found something"
    pub fn nonzero_exit_is_report(self) -> bool {
        matches!(self, Self::Audit | Self::Outdated)
    }

    /// Whether the request's package list is echoed back in the result
    pub fn reports_packages(self) -> bool {
        matches!(self, Self::Install | Self::Update | Self::Remove)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Audit => "audit",
            Self::Outdated => "outdated",
            Self::CleanCache => "cleanCache",
        }
    }
}

impl fmt::Display for LogicalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationFlags {
    pub dev: bool,
    pub global: bool,
    pub production: bool,
    pub force: bool,
    pub fix: bool,
}

/// One manager-bound call, already validated by the caller
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: LogicalOperation,
    /// Ordered specifiers, `name` or `name@range`
    pub packages: Vec<String>,
    pub working_dir: PathBuf,
    pub flags: OperationFlags,
    /// Skip detection and use this manager
    pub manager: Option<ManagerIdentity>,
}

impl OperationRequest {
    pub fn new(operation: LogicalOperation, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            operation,
            packages: Vec::new(),
            working_dir: working_dir.into(),
            flags: OperationFlags::default(),
            manager: None,
        }
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_manager(mut self, manager: ManagerIdentity) -> Self {
        self.manager = Some(manager);
        self
    }
}

/// Structured result of a manager-bound operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub operation: LogicalOperation,
    pub manager: ManagerIdentity,
    pub packages: Vec<String>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    pub duration_ms: u64,
}

/// Check a package specifier before it can reach an argv.
///
/// Accepts `name`, `@scope/name` and either followed by `@range`, where
/// the range uses only characters found in semver ranges and dist-tags.
pub fn validate_package_spec(spec: &str) -> Result<()> {
    let invalid = || GatewayError::InvalidPackageSpec(spec.to_string());

    if spec.is_empty() || spec.len() > 214 + 64 || spec.starts_with('-') {
        return Err(invalid());
    }

    let (name, range) = match spec.strip_prefix('@') {
        Some(rest) => match rest.find('@') {
            Some(at) => (&spec[..at + 1], Some(&rest[at + 1..])),
            None => (spec, None),
        },
        None => match spec.find('@') {
            Some(at) => (&spec[..at], Some(&spec[at + 1..])),
            None => (spec, None),
        },
    };

    if !is_valid_package_name(name) {
        return Err(invalid());
    }

    if let Some(range) = range {
        let range_ok = !range.is_empty()
            && range.chars().all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '.' | '-' | '_' | '^' | '~' | '*' | '<' | '>' | '=' | '|' | ' ' | '+')
            });
        if !range_ok {
            return Err(invalid());
        }
    }

    Ok(())
}

/// npm naming rules: lowercase, URL-safe, at most 214 characters,
/// optionally scoped as `@scope/name`.
pub fn is_valid_package_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 214 {
        return false;
    }

    let part_ok = |part: &str| {
        !part.is_empty()
            && !part.starts_with('.')
            && !part.starts_with('_')
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | '~'))
    };

    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, pkg)) => part_ok(scope) && part_ok(pkg),
            None => false,
        },
        None => part_ok(name),
    }
}

/// Register every package tool with the registry.
pub fn register_tools(reg: &mut Registry) {
    reg.register_tool(make_tool(
        "pkg.install",
        "pkg",
        "Install packages, or everything declared in package.json when none are given",
        "high",
        false,
        300000,
    ));

    reg.register_tool(make_tool(
        "pkg.update",
        "pkg",
        "Update the given packages, or all declared packages",
        "high",
        false,
        300000,
    ));

    reg.register_tool(make_tool(
        "pkg.remove",
        "pkg",
        "Remove packages from the project",
        "high",
        false,
        120000,
    ));

    reg.register_tool(make_tool(
        "pkg.audit",
        "pkg",
        "Run a security audit of installed dependencies, optionally applying fixes",
        "medium",
        false,
        120000,
    ));

    reg.register_tool(make_tool(
        "pkg.outdated",
        "pkg",
        "List dependencies with newer versions available",
        "low",
        true,
        60000,
    ));

    reg.register_tool(make_tool(
        "pkg.clean_cache",
        "pkg",
        "Clear the package manager's local cache or store",
        "medium",
        true,
        60000,
    ));

    reg.register_tool(make_tool(
        "pkg.search",
        "pkg",
        "Search the npm registry",
        "low",
        true,
        30000,
    ));

    reg.register_tool(make_tool(
        "pkg.info",
        "pkg",
        "Fetch registry metadata for a package",
        "low",
        true,
        30000,
    ));

    reg.register_tool(make_tool(
        "pkg.bundle_size",
        "pkg",
        "Report minified and gzipped bundle size of a package",
        "low",
        true,
        30000,
    ));

    reg.register_tool(make_tool(
        "pkg.download_stats",
        "pkg",
        "Report download counts for a package over a period",
        "low",
        true,
        30000,
    ));

    reg.register_tool(make_tool(
        "pkg.check_vulnerability",
        "pkg",
        "Query known vulnerabilities for a package version",
        "low",
        true,
        30000,
    ));

    reg.register_tool(make_tool(
        "pkg.list_licenses",
        "pkg",
        "List the declared licenses of packages",
        "low",
        true,
        60000,
    ));
}
