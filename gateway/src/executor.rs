//! Tool dispatch
//!
//! Pipeline: look up tool → decode and validate input → acquire permit →
//! call the package service → wrap the reply.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::pkg::service::PackageService;
use crate::pkg::{
    validate_package_spec, LogicalOperation, ManagerIdentity, OperationFlags, OperationRequest,
    OperationResult,
};
use crate::registry::Registry;

/// Reply to a single tool call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_id: String,
    pub duration_ms: u64,
}

/// Input of every manager-bound tool. Flags sit at the top level:
/// `{"workingDir": "/app", "packages": ["zod"], "dev": true}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagerInput {
    working_dir: PathBuf,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    manager: Option<ManagerIdentity>,
    #[serde(flatten)]
    flags: OperationFlags,
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

#[derive(Debug, Deserialize)]
struct PackageInput {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadsInput {
    name: String,
    #[serde(default = "default_period")]
    period: String,
}

#[derive(Debug, Deserialize)]
struct LicensesInput {
    packages: Vec<String>,
}

fn default_search_limit() -> u32 {
    20
}

fn default_period() -> String {
    "last-week".into()
}

/// A decoded, validated tool call
#[derive(Debug)]
enum ToolCall {
    Operation(OperationRequest),
    Search(SearchInput),
    Info(PackageInput),
    BundleSize(PackageInput),
    DownloadStats(DownloadsInput),
    CheckVulnerability(PackageInput),
    ListLicenses(LicensesInput),
}

fn decode_input<T: DeserializeOwned>(tool: &str, input: Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| GatewayError::InvalidInput(format!("{tool}: {e}")))
}

fn manager_operation(tool: &str) -> Option<LogicalOperation> {
    match tool {
        "pkg.install" => Some(LogicalOperation::Install),
        "pkg.update" => Some(LogicalOperation::Update),
        "pkg.remove" => Some(LogicalOperation::Remove),
        "pkg.audit" => Some(LogicalOperation::Audit),
        "pkg.outdated" => Some(LogicalOperation::Outdated),
        "pkg.clean_cache" => Some(LogicalOperation::CleanCache),
        _ => None,
    }
}

impl ToolCall {
    fn decode(tool: &str, input: Value) -> Result<Self> {
        if let Some(operation) = manager_operation(tool) {
            let input: ManagerInput = decode_input(tool, input)?;
            if !input.working_dir.is_dir() {
                return Err(GatewayError::InvalidInput(format!(
                    "{tool}: working directory {} does not exist",
                    input.working_dir.display()
                )));
            }
            for spec in &input.packages {
                validate_package_spec(spec)?;
            }

            let mut request = OperationRequest::new(operation, input.working_dir)
                .with_packages(input.packages)
                .with_flags(input.flags);
            if let Some(manager) = input.manager {
                request = request.with_manager(manager);
            }
            return Ok(Self::Operation(request));
        }

        let call = match tool {
            "pkg.search" => Self::Search(decode_input(tool, input)?),
            "pkg.info" => Self::Info(decode_input(tool, input)?),
            "pkg.bundle_size" => Self::BundleSize(decode_input(tool, input)?),
            "pkg.download_stats" => Self::DownloadStats(decode_input(tool, input)?),
            "pkg.check_vulnerability" => Self::CheckVulnerability(decode_input(tool, input)?),
            "pkg.list_licenses" => Self::ListLicenses(decode_input(tool, input)?),
            other => return Err(GatewayError::UnknownTool(other.to_string())),
        };
        Ok(call)
    }
}

enum Reply {
    Operation(OperationResult),
    Data(Value),
}

/// Routes tool calls to the package service behind a fixed-size gate
pub struct Dispatcher {
    registry: Registry,
    service: Arc<PackageService>,
    gate: Semaphore,
}

impl Dispatcher {
    pub fn new(registry: Registry, service: Arc<PackageService>, max_concurrent: usize) -> Self {
        Self {
            registry,
            service,
            gate: Semaphore::new(max_concurrent.max(1)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stop admitting calls; in-flight calls finish normally.
    pub fn close(&self) {
        self.gate.close();
    }

    /// Execute a tool call.
    ///
    /// Contract violations (unknown tool, malformed input, invalid package
    /// specifier) are errors. Command and upstream failures come back as a
    /// response with `success: false`.
    pub async fn execute(&self, tool_name: &str, input: Value) -> Result<ExecuteResponse> {
        let execution_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        // 1. Validate: tool exists and input decodes
        let tool = self
            .registry
            .get_tool(tool_name)
            .ok_or_else(|| GatewayError::UnknownTool(tool_name.to_string()))?;
        let call = ToolCall::decode(tool_name, input)?;

        // 2. Concurrency gate
        let _permit = self.gate.acquire().await.map_err(|_| GatewayError::Closed)?;

        info!(
            "Executing tool: {} (execution_id={}, risk={})",
            tool.name, execution_id, tool.risk_level
        );

        // 3. Execute
        let reply = self.dispatch(call).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match reply {
            Ok(Reply::Operation(result)) => ExecuteResponse {
                success: result.success,
                error: result.errors.as_ref().map(|errors| errors.join("\n")),
                output: serde_json::to_value(&result)?,
                execution_id,
                duration_ms,
            },
            Ok(Reply::Data(output)) => ExecuteResponse {
                success: true,
                output,
                error: None,
                execution_id,
                duration_ms,
            },
            Err(e) if e.is_contract_violation() => return Err(e),
            Err(e) => ExecuteResponse {
                success: false,
                output: Value::Null,
                error: Some(e.to_string()),
                execution_id,
                duration_ms,
            },
        };

        if response.success {
            info!("Tool {} completed in {}ms", tool_name, duration_ms);
        } else {
            warn!(
                "Tool {} failed in {}ms: {}",
                tool_name,
                duration_ms,
                response.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(response)
    }

    async fn dispatch(&self, call: ToolCall) -> Result<Reply> {
        let svc = &self.service;
        let reply = match call {
            ToolCall::Operation(request) => Reply::Operation(svc.run(&request).await?),
            ToolCall::Search(i) => Reply::Data(svc.search(&i.query, i.limit, i.offset).await?),
            ToolCall::Info(i) => Reply::Data(svc.package_info(&i.name).await?),
            ToolCall::BundleSize(i) => {
                Reply::Data(svc.bundle_size(&i.name, i.version.as_deref()).await?)
            }
            ToolCall::DownloadStats(i) => Reply::Data(svc.download_stats(&i.name, &i.period).await?),
            ToolCall::CheckVulnerability(i) => {
                Reply::Data(svc.check_vulnerability(&i.name, i.version.as_deref()).await?)
            }
            ToolCall::ListLicenses(i) => Reply::Data(svc.list_licenses(&i.packages).await?),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::GatewayConfig;
    use crate::pkg::register_tools;
    use crate::process::{CommandRunner, ExecutionOutcome};
    use crate::testing::{ScriptedRunner, StaticUpstream};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dispatcher_with(
        runner: Arc<dyn CommandRunner>,
        upstream: Arc<StaticUpstream>,
        max_concurrent: usize,
    ) -> Dispatcher {
        let mut config = GatewayConfig::default();
        config.executor.retry_backoff_ms = 0;
        let service = PackageService::new(runner, upstream, Arc::new(Cache::new(100)), &config);
        let mut registry = Registry::new();
        register_tools(&mut registry);
        Dispatcher::new(registry, Arc::new(service), max_concurrent)
    }

    fn dispatcher(runner: Arc<ScriptedRunner>) -> Dispatcher {
        dispatcher_with(runner, Arc::new(StaticUpstream::new()), 4)
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let d = dispatcher(Arc::new(ScriptedRunner::new()));
        let err = d.execute("pkg.publish", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool(name) if name == "pkg.publish"));
    }

    #[tokio::test]
    async fn test_malformed_input_is_rejected() {
        let d = dispatcher(Arc::new(ScriptedRunner::new()));

        let err = d.execute("pkg.install", json!({"packages": ["x"]})).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));

        let err = d.execute("pkg.search", json!({"query": 42})).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let d = dispatcher(runner.clone());
        let err = d
            .execute("pkg.audit", json!({"workingDir": "/definitely/not/here"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_specifier_never_reaches_runner() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let d = dispatcher(runner.clone());

        let err = d
            .execute(
                "pkg.install",
                json!({"workingDir": dir.path(), "packages": ["ok-pkg", "--ignore-scripts=false"]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPackageSpec(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flags_and_manager_pin_decode() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let d = dispatcher(runner.clone());

        let resp = d
            .execute(
                "pkg.install",
                json!({"workingDir": dir.path(), "packages": ["x"], "dev": true, "manager": "yarn"}),
            )
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.output["manager"], "yarn");
        assert_eq!(resp.output["packages"], json!(["x"]));
        assert_eq!(runner.count_calls(&["yarn", "add", "--dev", "x"]), 1);
        assert!(Uuid::parse_str(&resp.execution_id).is_ok());
    }

    #[tokio::test]
    async fn test_command_failure_is_unsuccessful_response() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(1, "npm ERR! code E404");
        let d = dispatcher(runner);

        let resp = d
            .execute("pkg.remove", json!({"workingDir": dir.path(), "packages": ["ghost"]}))
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("npm ERR! code E404"));
        assert_eq!(resp.output["success"], false);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_unsuccessful_response() {
        let d = dispatcher(Arc::new(ScriptedRunner::new()));
        let resp = d.execute("pkg.info", json!({"name": "nope"})).await.unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("404"));
        assert_eq!(resp.output, Value::Null);
    }

    #[tokio::test]
    async fn test_registry_tool_returns_data() {
        let upstream = Arc::new(StaticUpstream::new().with(
            "https://api.npmjs.org/downloads/point/last-week/zod",
            json!({"downloads": 99, "start": "2024-01-01", "end": "2024-01-07", "package": "zod"}),
        ));
        let d = dispatcher_with(Arc::new(ScriptedRunner::new()), upstream, 4);

        let resp = d.execute("pkg.download_stats", json!({"name": "zod"})).await.unwrap();
        assert!(resp.success);
        assert!(resp.error.is_none());
        assert_eq!(resp.output["downloads"], 99);
        assert_eq!(resp.output["period"], "last-week");
    }

    #[tokio::test]
    async fn test_response_serializes_camel_case() {
        let resp = ExecuteResponse {
            success: true,
            output: json!({}),
            error: None,
            execution_id: "id".into(),
            duration_ms: 3,
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["executionId"], "id");
        assert_eq!(v["durationMs"], 3);
        assert!(v.get("error").is_none());
    }

    /// Sleeps on every run and records the peak number of concurrent runs
    struct SlowRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _argv: &[String], _dir: &Path, _timeout: Duration) -> ExecutionOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            ExecutionOutcome {
                stdout: "ok".into(),
                attempts: 1,
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_gate_bounds_in_flight_calls() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(SlowRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let d = Arc::new(dispatcher_with(runner.clone(), Arc::new(StaticUpstream::new()), 2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let d = Arc::clone(&d);
            let input = json!({"workingDir": dir.path(), "manager": "npm"});
            handles.push(tokio::spawn(async move {
                d.execute("pkg.clean_cache", input).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }

        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_dispatcher_rejects_calls() {
        let d = dispatcher(Arc::new(ScriptedRunner::new()));
        d.close();
        let err = d.execute("pkg.search", json!({"query": "react"})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Closed));
    }
}
