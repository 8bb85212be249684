//! Configuration of the autoupdate server.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{http::HttpConfig, topic::DEFAULT_RETAIN};

/// Server configuration, loaded from a TOML file.
///
/// Every section has a default, so a partial (or missing) file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The HTTP listener.
    pub http: HttpConfig,
    /// The upstream datastore.
    pub upstream: UpstreamConfig,
    /// Change topic tuning.
    pub topic: TopicConfig,
    /// Optional address to serve Prometheus metrics on.
    pub metrics_addr: Option<SocketAddr>,
    /// Header carrying the authenticated user id.
    pub auth_header: String,
}

/// Where the upstream datastore lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the datastore's HTTP API.
    pub url: Url,
}

/// Tuning of the change topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Number of change events kept for slow subscribers.
    pub retain: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            upstream: UpstreamConfig::default(),
            topic: TopicConfig::default(),
            metrics_addr: None,
            auth_header: "x-user-id".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9010/internal/datastore/"
                .parse()
                .expect("valid url"),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            retain: DEFAULT_RETAIN,
        }
    }
}

impl Config {
    /// Load the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("reading config from {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&s).context("parsing config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.http.port, 9012);
        assert_eq!(config.topic.retain, DEFAULT_RETAIN);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [http]
            port = 8080
            bind_addr = "127.0.0.1"

            [upstream]
            url = "http://datastore.internal:9010/"
            "#,
        )
        .unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(
            config.upstream.url.as_str(),
            "http://datastore.internal:9010/"
        );
        assert_eq!(config.topic.retain, DEFAULT_RETAIN);
        assert_eq!(config.auth_header, "x-user-id");
    }
}
