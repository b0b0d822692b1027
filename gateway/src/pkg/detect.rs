//! Manager detection — decide which package manager governs a directory
//!
//! Priority, first match wins: lock file, manager config file, the
//! `packageManager` field of package.json, then npm. Only the well-known
//! files below are read; nothing is written.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::pkg::command::version_command;
use crate::pkg::ManagerIdentity;
use crate::process::CommandRunner;

/// Checked in order; pnpm wins ties, then yarn, then npm.
const LOCK_FILES: &[(ManagerIdentity, &str)] = &[
    (ManagerIdentity::Pnpm, "pnpm-lock.yaml"),
    (ManagerIdentity::Yarn, "yarn.lock"),
    (ManagerIdentity::Npm, "package-lock.json"),
    (ManagerIdentity::Npm, "npm-shrinkwrap.json"),
];

const CONFIG_FILES: &[(ManagerIdentity, &str)] = &[
    (ManagerIdentity::Pnpm, "pnpm-workspace.yaml"),
    (ManagerIdentity::Pnpm, ".pnpmfile.cjs"),
    (ManagerIdentity::Yarn, ".yarnrc.yml"),
    (ManagerIdentity::Yarn, ".yarnrc"),
    (ManagerIdentity::Npm, ".npmrc"),
];

const MANIFEST: &str = "package.json";

/// Which rule picked the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionSource {
    LockFile,
    ConfigFile,
    ManifestField,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub manager: ManagerIdentity,
    pub lock_file: Option<PathBuf>,
    pub version: Option<String>,
    pub source: DetectionSource,
}

/// Filesystem-only part of detection; `version` is always `None`.
pub fn detect_from_files(dir: &Path) -> DetectionResult {
    for (manager, name) in LOCK_FILES {
        let path = dir.join(name);
        if path.is_file() {
            return DetectionResult {
                manager: *manager,
                lock_file: Some(path),
                version: None,
                source: DetectionSource::LockFile,
            };
        }
    }

    for (manager, name) in CONFIG_FILES {
        if dir.join(name).is_file() {
            return DetectionResult {
                manager: *manager,
                lock_file: None,
                version: None,
                source: DetectionSource::ConfigFile,
            };
        }
    }

    if let Some(manager) = manifest_manager(dir) {
        return DetectionResult {
            manager,
            lock_file: None,
            version: None,
            source: DetectionSource::ManifestField,
        };
    }

    DetectionResult {
        manager: ManagerIdentity::Npm,
        lock_file: None,
        version: None,
        source: DetectionSource::Default,
    }
}

/// Read `packageManager` (e.g. `"pnpm@9.1.0"`) from package.json.
/// Unreadable or malformed manifests are ignored.
fn manifest_manager(dir: &Path) -> Option<ManagerIdentity> {
    let content = std::fs::read_to_string(dir.join(MANIFEST)).ok()?;
    let manifest: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring malformed {MANIFEST} in {}: {e}", dir.display());
            return None;
        }
    };
    let field = manifest.get("packageManager")?.as_str()?;
    let name = field.split('@').next().unwrap_or(field);
    ManagerIdentity::from_name(name)
}

/// Detects the manager and best-effort asks it for its version
#[derive(Clone)]
pub struct ManagerDetector {
    runner: Arc<dyn CommandRunner>,
    version_timeout: Duration,
}

impl ManagerDetector {
    pub fn new(runner: Arc<dyn CommandRunner>, version_timeout: Duration) -> Self {
        Self {
            runner,
            version_timeout,
        }
    }

    pub async fn detect(&self, dir: &Path) -> DetectionResult {
        let mut result = detect_from_files(dir);

        if result.source != DetectionSource::Default {
            result.version = self.query_version(result.manager, dir).await;
        }

        debug!(
            "Detected {} in {} via {:?} (version: {})",
            result.manager,
            dir.display(),
            result.source,
            result.version.as_deref().unwrap_or("unknown")
        );
        result
    }

    async fn query_version(&self, manager: ManagerIdentity, dir: &Path) -> Option<String> {
        let outcome = self
            .runner
            .run(&version_command(manager), dir, self.version_timeout)
            .await;

        if !outcome.success() {
            warn!(
                "Could not determine {} version (exit {}): {}",
                manager,
                outcome.exit_code,
                outcome.stderr.trim()
            );
            return None;
        }

        outcome
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches('v').to_string())
    }
}
