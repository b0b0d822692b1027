//! Package operation service
//!
//! Manager-bound operations: detect (unless pinned) → map → execute with
//! recovery → classify. Registry-bound operations: cache → upstream → cache.
//! Command failures come back as unsuccessful results, never as errors.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::{create_key, Cache, CacheMetrics};
use crate::clients::{Endpoints, UpstreamClient};
use crate::config::{CacheConfig, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::pkg::command::{build_command, CommandPlan, OutputFormat};
use crate::pkg::detect::ManagerDetector;
use crate::pkg::{
    is_valid_package_name, validate_package_spec, LogicalOperation, ManagerIdentity,
    OperationFlags, OperationRequest, OperationResult,
};
use crate::process::{CommandRunner, ExecutionOutcome, ProcessExecutor};

/// npm's search endpoint caps `size` at 250
const MAX_SEARCH_LIMIT: u32 = 250;

const DOWNLOAD_PERIODS: &[&str] = &["last-day", "last-week", "last-month", "last-year"];

pub struct PackageService {
    detector: ManagerDetector,
    executor: ProcessExecutor,
    cache: Arc<Cache<Value>>,
    upstream: Arc<dyn UpstreamClient>,
    endpoints: Endpoints,
    ttl: CacheConfig,
}

impl PackageService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        upstream: Arc<dyn UpstreamClient>,
        cache: Arc<Cache<Value>>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            detector: ManagerDetector::new(runner.clone(), config.executor.version_timeout()),
            executor: ProcessExecutor::new(runner, config.executor.recovery_policy()),
            cache,
            upstream,
            endpoints: Endpoints::new(&config.upstream),
            ttl: config.cache.clone(),
        }
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    // --- Manager-bound operations ---

    pub async fn install(
        &self,
        dir: &Path,
        packages: &[String],
        flags: OperationFlags,
    ) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::Install, dir, packages, flags)).await
    }

    pub async fn update(
        &self,
        dir: &Path,
        packages: &[String],
        flags: OperationFlags,
    ) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::Update, dir, packages, flags)).await
    }

    pub async fn remove(
        &self,
        dir: &Path,
        packages: &[String],
        flags: OperationFlags,
    ) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::Remove, dir, packages, flags)).await
    }

    pub async fn audit(&self, dir: &Path, flags: OperationFlags) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::Audit, dir, &[], flags)).await
    }

    pub async fn outdated(
        &self,
        dir: &Path,
        packages: &[String],
        flags: OperationFlags,
    ) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::Outdated, dir, packages, flags)).await
    }

    pub async fn clean_cache(&self, dir: &Path) -> Result<OperationResult> {
        self.run(&request(LogicalOperation::CleanCache, dir, &[], OperationFlags::default()))
            .await
    }

    /// Run any manager-bound operation.
    ///
    /// Errors only on contract violations (bad specifier, remove without
    /// packages); everything the CLI does is folded into the result.
    pub async fn run(&self, request: &OperationRequest) -> Result<OperationResult> {
        let start = Instant::now();
        let operation = request.operation;

        for spec in &request.packages {
            validate_package_spec(spec)?;
        }

        let manager = match request.manager {
            Some(manager) => manager,
            None => self.detector.detect(&request.working_dir).await.manager,
        };

        let argv = match build_command(
            operation,
            manager,
            &request.flags,
            &request.packages,
            OutputFormat::Json,
        )? {
            CommandPlan::Run(argv) => argv,
            CommandPlan::Unsupported { reason, .. } => {
                warn!("{operation} is not supported by {manager}: {reason}");
                return Ok(OperationResult {
                    success: false,
                    operation,
                    manager,
                    packages: reported_packages(request),
                    output: String::new(),
                    errors: Some(vec![reason]),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        info!("Running {operation} with {manager}: {}", argv.join(" "));
        let mut ran = argv;
        let mut outcome = self
            .executor
            .execute_with_recovery(&ran, &request.working_dir)
            .await;

        // A reporting command that printed nothing at all is ambiguous;
        // try the plain-text spelling once.
        if operation.nonzero_exit_is_report() && !outcome.has_output() {
            if let CommandPlan::Run(alternate) = build_command(
                operation,
                manager,
                &request.flags,
                &request.packages,
                OutputFormat::Text,
            )? {
                if alternate != ran {
                    debug!("Empty {operation} output, retrying as `{}`", alternate.join(" "));
                    outcome = self
                        .executor
                        .execute_with_recovery(&alternate, &request.working_dir)
                        .await;
                    ran = alternate;
                }
            }
        }

        let result = classify(request, manager, &ran, outcome, start.elapsed());
        if result.success {
            info!("{operation} with {manager} succeeded in {}ms", result.duration_ms);
        } else {
            warn!("{operation} with {manager} failed after {}ms", result.duration_ms);
        }
        Ok(result)
    }

    // --- Registry-bound operations ---

    async fn cached<F, Fut>(&self, key: String, ttl_seconds: u64, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.cache.get(&key) {
            info!("Cache hit: {key}");
            return Ok(value);
        }
        debug!("Cache miss: {key}");
        let value = fetch().await?;
        self.cache.set(key, value.clone(), ttl_seconds);
        Ok(value)
    }

    /// Search the registry. `limit` is clamped to 1..=250.
    pub async fn search(&self, query: &str, limit: u32, offset: u32) -> Result<Value> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::InvalidInput("search query is empty".into()));
        }
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let key = create_key("search", &[json!(query), json!(limit), json!(offset)]);
        let url = self.endpoints.search(query, limit, offset)?;

        self.cached(key, self.ttl.search_ttl_seconds, || async move {
            let raw = self.upstream.get_json(&url).await?;
            Ok(normalize_search(&raw))
        })
        .await
    }

    pub async fn package_info(&self, name: &str) -> Result<Value> {
        if !is_valid_package_name(name) {
            return Err(GatewayError::InvalidPackageSpec(name.to_string()));
        }
        let key = create_key("packageInfo", &[json!(name)]);
        let url = self.endpoints.package(name);

        self.cached(key, self.ttl.metadata_ttl_seconds, || async move {
            let raw = self.upstream.get_json(&url).await?;
            Ok(normalize_package_info(name, &raw))
        })
        .await
    }

    pub async fn bundle_size(&self, name: &str, version: Option<&str>) -> Result<Value> {
        validate_name_and_version(name, version)?;
        let key = create_key("bundleSize", &[json!(name), json!(version)]);
        let url = self.endpoints.bundle_size(name, version)?;

        self.cached(key, self.ttl.bundle_size_ttl_seconds, || async move {
            let raw = self.upstream.get_json(&url).await?;
            Ok(json!({
                "name": raw.get("name").cloned().unwrap_or_else(|| json!(name)),
                "version": raw.get("version").cloned().unwrap_or(Value::Null),
                "size": raw.get("size").cloned().unwrap_or(Value::Null),
                "gzip": raw.get("gzip").cloned().unwrap_or(Value::Null),
                "dependencyCount": raw.get("dependencyCount").cloned().unwrap_or(Value::Null),
            }))
        })
        .await
    }

    /// Downloads over `period`: last-day, last-week, last-month or last-year.
    pub async fn download_stats(&self, name: &str, period: &str) -> Result<Value> {
        if !is_valid_package_name(name) {
            return Err(GatewayError::InvalidPackageSpec(name.to_string()));
        }
        if !DOWNLOAD_PERIODS.contains(&period) {
            return Err(GatewayError::InvalidInput(format!(
                "unknown period {period:?}, expected one of {DOWNLOAD_PERIODS:?}"
            )));
        }
        let key = create_key("downloadStats", &[json!(name), json!(period)]);
        let url = self.endpoints.downloads(name, period);

        self.cached(key, self.ttl.downloads_ttl_seconds, || async move {
            let raw = self.upstream.get_json(&url).await?;
            Ok(json!({
                "package": name,
                "period": period,
                "downloads": raw.get("downloads").cloned().unwrap_or(json!(0)),
                "start": raw.get("start").cloned().unwrap_or(Value::Null),
                "end": raw.get("end").cloned().unwrap_or(Value::Null),
            }))
        })
        .await
    }

    /// Known advisories for a package (optionally a specific version) from OSV.
    pub async fn check_vulnerability(&self, name: &str, version: Option<&str>) -> Result<Value> {
        validate_name_and_version(name, version)?;
        let key = create_key("checkVulnerability", &[json!(name), json!(version)]);
        let url = self.endpoints.osv_query();

        let mut body = json!({ "package": { "name": name, "ecosystem": "npm" } });
        if let Some(version) = version {
            body["version"] = json!(version);
        }

        self.cached(key, self.ttl.vulnerability_ttl_seconds, || async move {
            let raw = self.upstream.post_json(&url, &body).await?;
            Ok(normalize_vulnerabilities(name, version, &raw))
        })
        .await
    }

    /// Declared license of each package. Lookups that fail are reported
    /// per package instead of failing the batch.
    pub async fn list_licenses(&self, packages: &[String]) -> Result<Value> {
        if packages.is_empty() {
            return Err(GatewayError::InvalidInput("no packages given".into()));
        }

        let mut entries = Vec::with_capacity(packages.len());
        let mut summary: BTreeMap<String, u64> = BTreeMap::new();

        for spec in packages {
            validate_package_spec(spec)?;
            let name = package_name(spec);
            let entry = match self.package_info(name).await {
                Ok(info) => {
                    let license = info
                        .get("license")
                        .and_then(Value::as_str)
                        .unwrap_or("UNKNOWN")
                        .to_string();
                    *summary.entry(license.clone()).or_default() += 1;
                    json!({ "name": name, "license": license })
                }
                Err(e) => {
                    warn!("License lookup for {name} failed: {e}");
                    *summary.entry("UNKNOWN".to_string()).or_default() += 1;
                    json!({ "name": name, "license": "UNKNOWN", "error": e.to_string() })
                }
            };
            entries.push(entry);
        }

        Ok(json!({ "packages": entries, "summary": summary }))
    }
}

fn request(
    operation: LogicalOperation,
    dir: &Path,
    packages: &[String],
    flags: OperationFlags,
) -> OperationRequest {
    OperationRequest::new(operation, dir)
        .with_packages(packages.iter().cloned())
        .with_flags(flags)
}

fn reported_packages(request: &OperationRequest) -> Vec<String> {
    if request.operation.reports_packages() {
        request.packages.clone()
    } else {
        Vec::new()
    }
}

/// Fold an execution outcome into the caller-facing result.
///
/// Exit 0 is success. `audit` and `outdated` exit non-zero when they find
/// something; with a report on stdout that is still success.
fn classify(
    request: &OperationRequest,
    manager: ManagerIdentity,
    argv: &[String],
    outcome: ExecutionOutcome,
    elapsed: Duration,
) -> OperationResult {
    let stdout = outcome.stdout.trim();
    let stderr = outcome.stderr.trim();

    let success = outcome.success()
        || (request.operation.nonzero_exit_is_report()
            && outcome.exit_code > 0
            && !stdout.is_empty());

    let errors = if success {
        None
    } else {
        let detail = if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            format!("{} exited with code {}", argv.join(" "), outcome.exit_code)
        };
        Some(vec![detail])
    };

    OperationResult {
        success,
        operation: request.operation,
        manager,
        packages: reported_packages(request),
        output: stdout.to_string(),
        errors,
        duration_ms: elapsed.as_millis() as u64,
    }
}

fn validate_name_and_version(name: &str, version: Option<&str>) -> Result<()> {
    if !is_valid_package_name(name) {
        return Err(GatewayError::InvalidPackageSpec(name.to_string()));
    }
    if let Some(version) = version {
        validate_package_spec(&format!("{name}@{version}"))?;
    }
    Ok(())
}

/// `name` part of `name@range` / `@scope/name@range`
fn package_name(spec: &str) -> &str {
    let search_from = usize::from(spec.starts_with('@'));
    match spec[search_from..].find('@') {
        Some(at) => &spec[..at + search_from],
        None => spec,
    }
}

fn normalize_search(raw: &Value) -> Value {
    let packages: Vec<Value> = raw
        .get("objects")
        .and_then(Value::as_array)
        .map(|objects| {
            objects
                .iter()
                .map(|o| {
                    let pkg = &o["package"];
                    json!({
                        "name": pkg["name"],
                        "version": pkg["version"],
                        "description": pkg.get("description").cloned().unwrap_or(json!("")),
                        "score": o["score"]["final"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "total": raw.get("total").cloned().unwrap_or(json!(packages.len())),
        "packages": packages,
    })
}

/// `"MIT"`, `{ "type": "MIT" }` or `[{ "type": "MIT" }, ...]`
fn license_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => obj.get("type").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(license_string).collect();
            (!parts.is_empty()).then(|| parts.join(" OR "))
        }
        _ => None,
    }
}

fn normalize_package_info(name: &str, raw: &Value) -> Value {
    let null = Value::Null;
    let latest = raw["dist-tags"]["latest"].as_str();
    let latest_manifest = latest.map(|v| &raw["versions"][v]).unwrap_or(&null);

    let license = license_string(&latest_manifest["license"])
        .or_else(|| license_string(&raw["license"]))
        .or_else(|| license_string(&latest_manifest["licenses"]));

    let repository = match &raw["repository"] {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    let dependencies = latest_manifest
        .get("dependencies")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    json!({
        "name": raw.get("name").cloned().unwrap_or_else(|| json!(name)),
        "description": raw.get("description").cloned().unwrap_or(Value::Null),
        "latestVersion": latest,
        "license": license,
        "homepage": raw.get("homepage").cloned().unwrap_or(Value::Null),
        "repository": repository,
        "dependencies": dependencies,
        "versionCount": raw.get("versions").and_then(Value::as_object).map(|v| v.len()).unwrap_or(0),
        "modified": raw["time"].get("modified").cloned().unwrap_or(Value::Null),
    })
}

fn normalize_vulnerabilities(name: &str, version: Option<&str>, raw: &Value) -> Value {
    let vulnerabilities: Vec<Value> = raw
        .get("vulns")
        .and_then(Value::as_array)
        .map(|vulns| {
            vulns
                .iter()
                .map(|v| {
                    let severity = v["database_specific"]["severity"]
                        .as_str()
                        .or_else(|| v["severity"][0]["score"].as_str())
                        .unwrap_or("UNKNOWN");
                    json!({
                        "id": v["id"],
                        "summary": v.get("summary").cloned().unwrap_or(json!("")),
                        "severity": severity,
                        "aliases": v.get("aliases").cloned().unwrap_or(json!([])),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "package": name,
        "version": version,
        "vulnerabilityCount": vulnerabilities.len(),
        "vulnerabilities": vulnerabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, StaticUpstream};

    fn service(runner: Arc<ScriptedRunner>, upstream: Arc<StaticUpstream>) -> PackageService {
        let mut config = GatewayConfig::default();
        config.executor.retry_backoff_ms = 0;
        PackageService::new(runner, upstream, Arc::new(Cache::new(100)), &config)
    }

    fn local(runner: Arc<ScriptedRunner>) -> PackageService {
        service(runner, Arc::new(StaticUpstream::new()))
    }

    fn pinned(op: LogicalOperation, manager: ManagerIdentity) -> OperationRequest {
        OperationRequest::new(op, ".").with_manager(manager)
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_reporting_operations_treat_nonzero_exit_as_success() {
        for op in [LogicalOperation::Audit, LogicalOperation::Outdated] {
            let runner = Arc::new(ScriptedRunner::new());
            runner.push(ExecutionOutcome {
                exit_code: 1,
                stdout: r#"{"lodash":{"current":"4.17.20","latest":"4.17.21"}}"#.into(),
                ..Default::default()
            });

            let result = local(runner).run(&pinned(op, ManagerIdentity::Npm)).await.unwrap();
            assert!(result.success, "{op}");
            assert!(result.output.contains("lodash"));
            assert!(result.errors.is_none());
        }
    }

    #[tokio::test]
    async fn test_other_operations_treat_nonzero_exit_as_failure() {
        for op in [
            LogicalOperation::Install,
            LogicalOperation::Update,
            LogicalOperation::Remove,
            LogicalOperation::CleanCache,
        ] {
            let runner = Arc::new(ScriptedRunner::new());
            // cache clean is pre-answered by the runner; override it
            runner.respond(&["pnpm", "store", "prune"], ExecutionOutcome {
                exit_code: 1,
                stdout: "some output".into(),
                ..Default::default()
            });
            runner.push(ExecutionOutcome {
                exit_code: 1,
                stdout: "some output".into(),
                ..Default::default()
            });

            let request = pinned(op, ManagerIdentity::Pnpm).with_packages(["zod"]);
            let result = local(runner).run(&request).await.unwrap();
            assert!(!result.success, "{op}");
            assert_eq!(result.errors, Some(vec!["some output".to_string()]), "{op}");
        }
    }

    #[tokio::test]
    async fn test_failure_prefers_stderr() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ExecutionOutcome {
            exit_code: 1,
            stdout: "partial".into(),
            stderr: "npm ERR! 404 Not Found - GET https://registry.npmjs.org/nope".into(),
            ..Default::default()
        });

        let request = pinned(LogicalOperation::Install, ManagerIdentity::Npm).with_packages(["nope"]);
        let result = local(runner).run(&request).await.unwrap();
        assert!(!result.success);
        assert!(result.errors.unwrap()[0].contains("404"));
        assert_eq!(result.output, "partial");
    }

    #[tokio::test]
    async fn test_audit_with_only_stderr_is_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(1, "npm ERR! code ENOLOCK");

        let result = local(runner)
            .run(&pinned(LogicalOperation::Audit, ManagerIdentity::Npm))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.errors, Some(vec!["npm ERR! code ENOLOCK".to_string()]));
    }

    #[tokio::test]
    async fn test_empty_report_retries_with_text_invocation() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ExecutionOutcome {
            exit_code: 1,
            ..Default::default()
        });
        runner.push(ExecutionOutcome {
            exit_code: 1,
            stdout: "Package  Current  Wanted  Latest\nreact    17.0.2   17.0.2  18.3.1".into(),
            ..Default::default()
        });

        let result = local(runner.clone())
            .run(&pinned(LogicalOperation::Outdated, ManagerIdentity::Pnpm))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.output.contains("react"));
        assert_eq!(runner.count_calls(&["pnpm", "outdated", "--format", "json"]), 1);
        assert_eq!(runner.count_calls(&["pnpm", "outdated"]), 1);
    }

    #[tokio::test]
    async fn test_failure_names_the_text_invocation_when_it_ran_last() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ExecutionOutcome {
            exit_code: 1,
            ..Default::default()
        });
        runner.push(ExecutionOutcome {
            exit_code: 2,
            ..Default::default()
        });

        let result = local(runner.clone())
            .run(&pinned(LogicalOperation::Audit, ManagerIdentity::Npm))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.errors,
            Some(vec!["npm audit exited with code 2".to_string()])
        );
        assert_eq!(runner.count_calls(&["npm", "audit", "--json"]), 1);
        assert_eq!(runner.count_calls(&["npm", "audit"]), 1);
    }

    #[tokio::test]
    async fn test_unsupported_plan_does_not_spawn() {
        let runner = Arc::new(ScriptedRunner::new());
        let request = pinned(LogicalOperation::Audit, ManagerIdentity::Yarn).with_flags(OperationFlags {
            fix: true,
            ..Default::default()
        });

        let result = local(runner.clone()).run(&request).await.unwrap();
        assert!(!result.success);
        assert!(result.errors.unwrap()[0].contains("yarn audit cannot apply fixes"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_contract_violations_are_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        let svc = local(runner.clone());

        let err = svc
            .run(&pinned(LogicalOperation::Remove, ManagerIdentity::Npm))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingPackages(LogicalOperation::Remove)));

        let err = svc
            .run(&pinned(LogicalOperation::Install, ManagerIdentity::Npm).with_packages(["--registry=x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPackageSpec(_)));

        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_packages_reported_only_for_mutating_operations() {
        let runner = Arc::new(ScriptedRunner::new());
        let svc = local(runner);

        let install = svc
            .run(&pinned(LogicalOperation::Install, ManagerIdentity::Npm).with_packages(["a", "b"]))
            .await
            .unwrap();
        assert_eq!(install.packages, strings(&["a", "b"]));

        let outdated = svc
            .run(&pinned(LogicalOperation::Outdated, ManagerIdentity::Npm).with_packages(["a"]))
            .await
            .unwrap();
        assert!(outdated.packages.is_empty());
    }

    #[tokio::test]
    async fn test_detection_is_used_when_not_pinned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let result = local(runner.clone())
            .update(dir.path(), &strings(&["zod"]), OperationFlags::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.manager, ManagerIdentity::Pnpm);
        assert_eq!(runner.count_calls(&["pnpm", "--version"]), 1);
        assert_eq!(runner.count_calls(&["pnpm", "update", "zod"]), 1);
    }

    #[tokio::test]
    async fn test_clean_cache_uses_manager_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let result = local(runner.clone()).clean_cache(dir.path()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.operation, LogicalOperation::CleanCache);
        assert_eq!(runner.count_calls(&["yarn", "cache", "clean"]), 1);
    }

    fn search_body() -> Value {
        json!({
            "total": 2,
            "objects": [
                {"package": {"name": "react", "version": "18.3.1", "description": "UI"}, "score": {"final": 0.98}},
                {"package": {"name": "react-dom", "version": "18.3.1"}, "score": {"final": 0.9}}
            ]
        })
    }

    const SEARCH_URL: &str = "https://registry.npmjs.org/-/v1/search?text=react&size=25&from=0";

    #[tokio::test]
    async fn test_search_normalizes_and_caches() {
        let upstream = Arc::new(StaticUpstream::new().with(SEARCH_URL, search_body()));
        let svc = service(Arc::new(ScriptedRunner::new()), upstream.clone());

        let first = svc.search("react", 25, 0).await.unwrap();
        assert_eq!(first["total"], 2);
        assert_eq!(first["packages"][0]["name"], "react");
        assert_eq!(first["packages"][1]["description"], "");

        let second = svc.search("react", 25, 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(upstream.call_count(), 1);

        let m = svc.cache_metrics();
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
    }

    #[tokio::test]
    async fn test_search_different_arguments_do_not_share_entries() {
        let upstream = Arc::new(
            StaticUpstream::new()
                .with(SEARCH_URL, search_body())
                .with(
                    "https://registry.npmjs.org/-/v1/search?text=react&size=25&from=25",
                    json!({"total": 2, "objects": []}),
                ),
        );
        let svc = service(Arc::new(ScriptedRunner::new()), upstream.clone());

        svc.search("react", 25, 0).await.unwrap();
        let page2 = svc.search("react", 25, 25).await.unwrap();
        assert_eq!(page2["packages"], json!([]));
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query() {
        let svc = local(Arc::new(ScriptedRunner::new()));
        assert!(matches!(svc.search("  ", 10, 0).await, Err(GatewayError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_upstream_errors_are_not_cached() {
        let upstream = Arc::new(StaticUpstream::new());
        let svc = service(Arc::new(ScriptedRunner::new()), upstream.clone());

        assert!(svc.package_info("missing-pkg").await.is_err());
        assert!(svc.package_info("missing-pkg").await.is_err());
        assert_eq!(upstream.call_count(), 2);
        assert_eq!(svc.cache_metrics().key_count, 0);
    }

    #[tokio::test]
    async fn test_package_info_normalization() {
        let upstream = Arc::new(StaticUpstream::new().with(
            "https://registry.npmjs.org/@types%2Fnode",
            json!({
                "name": "@types/node",
                "description": "TypeScript definitions for node",
                "dist-tags": {"latest": "20.11.0"},
                "versions": {
                    "20.10.0": {"license": "MIT"},
                    "20.11.0": {"license": "MIT", "dependencies": {"undici-types": "~5.26.4"}}
                },
                "repository": {"type": "git", "url": "https://github.com/DefinitelyTyped/DefinitelyTyped.git"},
                "time": {"modified": "2024-01-10T00:00:00.000Z"}
            }),
        ));
        let svc = service(Arc::new(ScriptedRunner::new()), upstream);

        let info = svc.package_info("@types/node").await.unwrap();
        assert_eq!(info["latestVersion"], "20.11.0");
        assert_eq!(info["license"], "MIT");
        assert_eq!(info["versionCount"], 2);
        assert_eq!(info["dependencies"]["undici-types"], "~5.26.4");
        assert_eq!(
            info["repository"],
            "https://github.com/DefinitelyTyped/DefinitelyTyped.git"
        );
    }

    #[test]
    fn test_license_string_shapes() {
        assert_eq!(license_string(&json!("ISC")), Some("ISC".into()));
        assert_eq!(license_string(&json!({"type": "BSD-3-Clause"})), Some("BSD-3-Clause".into()));
        assert_eq!(
            license_string(&json!([{"type": "MIT"}, {"type": "Apache-2.0"}])),
            Some("MIT OR Apache-2.0".into())
        );
        assert_eq!(license_string(&json!(null)), None);
        assert_eq!(license_string(&json!("")), None);
    }

    #[test]
    fn test_package_name_strips_range() {
        assert_eq!(package_name("react"), "react");
        assert_eq!(package_name("react@^18"), "react");
        assert_eq!(package_name("@types/node"), "@types/node");
        assert_eq!(package_name("@types/node@20"), "@types/node");
    }

    #[tokio::test]
    async fn test_list_licenses_reports_failures_per_package() {
        let upstream = Arc::new(StaticUpstream::new().with(
            "https://registry.npmjs.org/left-pad",
            json!({"name": "left-pad", "dist-tags": {"latest": "1.3.0"}, "versions": {"1.3.0": {"license": "WTFPL"}}}),
        ));
        let svc = service(Arc::new(ScriptedRunner::new()), upstream);

        let out = svc
            .list_licenses(&strings(&["left-pad@^1.0.0", "gone-pkg"]))
            .await
            .unwrap();
        assert_eq!(out["packages"][0]["license"], "WTFPL");
        assert_eq!(out["packages"][1]["license"], "UNKNOWN");
        assert!(out["packages"][1]["error"].as_str().unwrap().contains("404"));
        assert_eq!(out["summary"]["WTFPL"], 1);
        assert_eq!(out["summary"]["UNKNOWN"], 1);
    }

    #[tokio::test]
    async fn test_check_vulnerability_posts_query_and_normalizes() {
        let upstream = Arc::new(StaticUpstream::new().with(
            "https://api.osv.dev/v1/query",
            json!({"vulns": [
                {"id": "GHSA-jf85-cpcp-j695", "summary": "Prototype Pollution in lodash",
                 "aliases": ["CVE-2019-10744"], "database_specific": {"severity": "CRITICAL"}},
                {"id": "GHSA-x", "severity": [{"type": "CVSS_V3", "score": "CVSS:3.1/AV:N"}]}
            ]}),
        ));
        let svc = service(Arc::new(ScriptedRunner::new()), upstream.clone());

        let out = svc.check_vulnerability("lodash", Some("4.17.11")).await.unwrap();
        assert_eq!(out["vulnerabilityCount"], 2);
        assert_eq!(out["vulnerabilities"][0]["severity"], "CRITICAL");
        assert_eq!(out["vulnerabilities"][1]["severity"], "CVSS:3.1/AV:N");
        assert_eq!(out["vulnerabilities"][1]["summary"], "");

        let body = &upstream.bodies()[0];
        assert_eq!(body["package"]["ecosystem"], "npm");
        assert_eq!(body["version"], "4.17.11");

        // Cached: a second query with the same arguments stays local
        svc.check_vulnerability("lodash", Some("4.17.11")).await.unwrap();
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_advisories_is_empty_list() {
        let upstream = Arc::new(StaticUpstream::new().with("https://api.osv.dev/v1/query", json!({})));
        let svc = service(Arc::new(ScriptedRunner::new()), upstream);
        let out = svc.check_vulnerability("react", None).await.unwrap();
        assert_eq!(out["vulnerabilityCount"], 0);
        assert_eq!(out["version"], Value::Null);
    }

    #[tokio::test]
    async fn test_bundle_size_and_downloads() {
        let upstream = Arc::new(
            StaticUpstream::new()
                .with(
                    "https://bundlephobia.com/api/size?package=preact%4010.19.3",
                    json!({"name": "preact", "version": "10.19.3", "size": 11000, "gzip": 4500, "dependencyCount": 0}),
                )
                .with(
                    "https://api.npmjs.org/downloads/point/last-month/preact",
                    json!({"downloads": 12345, "start": "2024-01-01", "end": "2024-01-31", "package": "preact"}),
                ),
        );
        let svc = service(Arc::new(ScriptedRunner::new()), upstream);

        let size = svc.bundle_size("preact", Some("10.19.3")).await.unwrap();
        assert_eq!(size["gzip"], 4500);

        let downloads = svc.download_stats("preact", "last-month").await.unwrap();
        assert_eq!(downloads["downloads"], 12345);
        assert_eq!(downloads["period"], "last-month");

        assert!(matches!(
            svc.download_stats("preact", "forever").await,
            Err(GatewayError::InvalidInput(_))
        ));
    }
}
