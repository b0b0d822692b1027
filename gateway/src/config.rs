//! Gateway configuration loading and parsing

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::process::RecoveryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pkg-gateway/config.toml";
pub const CONFIG_ENV: &str = "PKG_GATEWAY_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Per-attempt subprocess timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_version_timeout_ms")]
    pub version_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Size of the concurrency gate in front of the service
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            version_timeout_ms: default_version_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl ExecutorConfig {
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_millis(self.version_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
    /// Interval of the expired-entry sweep
    #[serde(default = "default_check_period")]
    pub check_period_seconds: u64,
    #[serde(default = "default_search_ttl")]
    pub search_ttl_seconds: u64,
    #[serde(default = "default_hour_ttl")]
    pub metadata_ttl_seconds: u64,
    #[serde(default = "default_hour_ttl")]
    pub bundle_size_ttl_seconds: u64,
    #[serde(default = "default_hour_ttl")]
    pub downloads_ttl_seconds: u64,
    #[serde(default = "default_hour_ttl")]
    pub vulnerability_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            check_period_seconds: default_check_period(),
            search_ttl_seconds: default_search_ttl(),
            metadata_ttl_seconds: default_hour_ttl(),
            bundle_size_ttl_seconds: default_hour_ttl(),
            downloads_ttl_seconds: default_hour_ttl(),
            vulnerability_ttl_seconds: default_hour_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_downloads_url")]
    pub downloads_url: String,
    #[serde(default = "default_bundlephobia_url")]
    pub bundlephobia_url: String,
    #[serde(default = "default_osv_url")]
    pub osv_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            downloads_url: default_downloads_url(),
            bundlephobia_url: default_bundlephobia_url(),
            osv_url: default_osv_url(),
            timeout_seconds: default_upstream_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".into()
}
fn default_timeout_ms() -> u64 {
    120_000
}
fn default_version_timeout_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_keys() -> usize {
    1000
}
fn default_check_period() -> u64 {
    600
}
fn default_search_ttl() -> u64 {
    900
}
fn default_hour_ttl() -> u64 {
    3600
}
fn default_registry_url() -> String {
    "https://registry.npmjs.org".into()
}
fn default_downloads_url() -> String {
    "https://api.npmjs.org".into()
}
fn default_bundlephobia_url() -> String {
    "https://bundlephobia.com".into()
}
fn default_osv_url() -> String {
    "https://api.osv.dev".into()
}
fn default_upstream_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("pkg-gateway/", env!("CARGO_PKG_VERSION")).into()
}

impl GatewayConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: GatewayConfig =
            toml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_attempts == 0 {
            return Err(GatewayError::Config("executor.max_attempts must be at least 1".into()));
        }
        if self.executor.max_concurrent == 0 {
            return Err(GatewayError::Config("executor.max_concurrent must be at least 1".into()));
        }
        if self.executor.timeout_ms == 0 {
            return Err(GatewayError::Config("executor.timeout_ms must be positive".into()));
        }
        if self.cache.check_period_seconds == 0 {
            return Err(GatewayError::Config("cache.check_period_seconds must be positive".into()));
        }
        Ok(())
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// Nothing at this path; built-in defaults are in effect
    Defaults(PathBuf),
}

/// Load from `$PKG_GATEWAY_CONFIG`, else the default path; a missing file
/// yields defaults. Nothing is logged here so the caller can report the
/// source once its subscriber is installed.
pub fn load_config() -> Result<(GatewayConfig, ConfigSource)> {
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&config_path))
}

pub fn load_config_from(path: &Path) -> Result<(GatewayConfig, ConfigSource)> {
    if path.exists() {
        let content = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = GatewayConfig::from_toml(&content)?;
        Ok((config, ConfigSource::File(path.to_path_buf())))
    } else {
        Ok((GatewayConfig::default(), ConfigSource::Defaults(path.to_path_buf())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.executor.max_concurrent, 4);
        assert_eq!(config.cache.max_keys, 1000);
        assert_eq!(config.cache.search_ttl_seconds, 900);
        assert_eq!(config.cache.metadata_ttl_seconds, 3600);
        assert_eq!(config.upstream.registry_url, "https://registry.npmjs.org");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = GatewayConfig::from_toml(
            r#"
            [executor]
            timeout_ms = 60000
            retry_backoff_ms = 250

            [cache]
            search_ttl_seconds = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.executor.timeout_ms, 60000);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.cache.search_ttl_seconds, 120);
        assert_eq!(config.cache.bundle_size_ttl_seconds, 3600);

        let policy = config.executor.recovery_policy();
        assert_eq!(policy.backoff, Duration::from_millis(250));
        assert_eq!(policy.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config.upstream.timeout_seconds, 30);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = GatewayConfig::from_toml("[executor]\nmax_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_rejects_zero_sweep_period() {
        let err = GatewayConfig::from_toml("[cache]\ncheck_period_seconds = 0").unwrap_err();
        assert!(err.to_string().contains("check_period_seconds"));
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(matches!(
            GatewayConfig::from_toml("[cache\nmax_keys = 1"),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let (config, source) = load_config_from(&missing).unwrap();
        assert_eq!(config.cache.max_keys, 1000);
        assert_eq!(source, ConfigSource::Defaults(missing));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        let (config, source) = load_config_from(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(source, ConfigSource::File(path));
    }
}
