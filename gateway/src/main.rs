//! pkg-gateway — execute one package tool call and print the JSON response
//!
//! Usage:
//!   pkg-gateway <tool> [json-input]
//!   pkg-gateway --list
//!
//! Logs go to stderr so stdout carries only the response.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkg_gateway::cache::Cache;
use pkg_gateway::clients::HttpClient;
use pkg_gateway::config::{load_config, ConfigSource};
use pkg_gateway::pkg::register_tools;
use pkg_gateway::process::SystemRunner;
use pkg_gateway::registry::Registry;
use pkg_gateway::{Dispatcher, PackageService};

const USAGE: &str = "usage: pkg-gateway <tool> [json-input] | pkg-gateway --list";

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = load_config().context("Failed to load configuration")?;
    init_logging(&config.logging.level)?;
    match &source {
        ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
        ConfigSource::Defaults(path) => {
            warn!("Config file not found at {}, using defaults", path.display())
        }
    }

    let mut args = std::env::args().skip(1);
    let Some(tool) = args.next() else {
        bail!(USAGE);
    };

    let mut registry = Registry::new();
    register_tools(&mut registry);

    if tool == "--list" {
        let tools = registry.list_tools("pkg");
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    let input = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("Tool input is not valid JSON")?,
        None => serde_json::json!({}),
    };

    let cancel = CancellationToken::new();
    let cache = Arc::new(Cache::new(config.cache.max_keys));
    let sweeper = Arc::clone(&cache).spawn_sweeper(
        Duration::from_secs(config.cache.check_period_seconds),
        cancel.clone(),
    );

    let upstream =
        Arc::new(HttpClient::new(&config.upstream).context("Failed to build HTTP client")?);
    let service = Arc::new(PackageService::new(
        Arc::new(SystemRunner),
        upstream,
        cache,
        &config,
    ));
    let dispatcher = Dispatcher::new(registry, service, config.executor.max_concurrent);

    info!("pkg-gateway v{} executing {}", env!("CARGO_PKG_VERSION"), tool);
    let result = dispatcher.execute(&tool, input).await;

    dispatcher.close();
    cancel.cancel();
    let _ = sweeper.await;

    let response = result.with_context(|| format!("Tool call {tool} rejected"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}
