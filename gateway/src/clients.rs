//! Registry and advisory clients — JSON over HTTP
//!
//! The service only needs JSON in and out, so the seam is a small trait
//! with an HTTP implementation on reqwest.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value>;
}

/// reqwest-backed client
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    async fn read(url: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl UpstreamClient for HttpClient {
    async fn get_json(&self, url: &str) -> Result<Value> {
        debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        Self::read(url, response).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        debug!("POST {url}");
        let response = self.client.post(url).json(body).send().await?;
        Self::read(url, response).await
    }
}

/// URL construction for every upstream endpoint
#[derive(Debug, Clone)]
pub struct Endpoints {
    registry: String,
    downloads: String,
    bundlephobia: String,
    osv: String,
}

impl Endpoints {
    pub fn new(config: &UpstreamConfig) -> Self {
        let trim = |s: &str| s.trim_end_matches('/').to_string();
        Self {
            registry: trim(&config.registry_url),
            downloads: trim(&config.downloads_url),
            bundlephobia: trim(&config.bundlephobia_url),
            osv: trim(&config.osv_url),
        }
    }

    pub fn search(&self, query: &str, size: u32, from: u32) -> Result<String> {
        let url = Url::parse_with_params(
            &format!("{}/-/v1/search", self.registry),
            &[
                ("text", query.to_string()),
                ("size", size.to_string()),
                ("from", from.to_string()),
            ],
        )
        .map_err(|e| GatewayError::Config(format!("invalid registry url: {e}")))?;
        Ok(url.into())
    }

    /// Scoped names keep the `@` but escape the slash
    pub fn package(&self, name: &str) -> String {
        format!("{}/{}", self.registry, name.replace('/', "%2F"))
    }

    pub fn bundle_size(&self, name: &str, version: Option<&str>) -> Result<String> {
        let package = match version {
            Some(v) => format!("{name}@{v}"),
            None => name.to_string(),
        };
        let url = Url::parse_with_params(
            &format!("{}/api/size", self.bundlephobia),
            &[("package", package)],
        )
        .map_err(|e| GatewayError::Config(format!("invalid bundlephobia url: {e}")))?;
        Ok(url.into())
    }

    pub fn downloads(&self, name: &str, period: &str) -> String {
        format!("{}/downloads/point/{}/{}", self.downloads, period, name)
    }

    pub fn osv_query(&self) -> String {
        format!("{}/v1/query", self.osv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints::new(&UpstreamConfig::default())
    }

    #[test]
    fn test_search_url_encodes_query() {
        let url = endpoints().search("react hooks", 25, 0).unwrap();
        assert_eq!(
            url,
            "https://registry.npmjs.org/-/v1/search?text=react+hooks&size=25&from=0"
        );
    }

    #[test]
    fn test_package_url_scoped() {
        assert_eq!(endpoints().package("react"), "https://registry.npmjs.org/react");
        assert_eq!(
            endpoints().package("@types/node"),
            "https://registry.npmjs.org/@types%2Fnode"
        );
    }

    #[test]
    fn test_bundle_size_url() {
        let url = endpoints().bundle_size("lodash", Some("4.17.21")).unwrap();
        assert_eq!(url, "https://bundlephobia.com/api/size?package=lodash%404.17.21");
        let url = endpoints().bundle_size("lodash", None).unwrap();
        assert_eq!(url, "https://bundlephobia.com/api/size?package=lodash");
    }

    #[test]
    fn test_downloads_and_osv_urls() {
        assert_eq!(
            endpoints().downloads("react", "last-week"),
            "https://api.npmjs.org/downloads/point/last-week/react"
        );
        assert_eq!(endpoints().osv_query(), "https://api.osv.dev/v1/query");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = UpstreamConfig {
            registry_url: "http://localhost:4873/".into(),
            ..Default::default()
        };
        assert_eq!(Endpoints::new(&config).package("x"), "http://localhost:4873/x");
    }

    #[test]
    fn test_http_client_builds() {
        assert!(HttpClient::new(&UpstreamConfig::default()).is_ok());
    }
}
