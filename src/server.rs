//! The main server which ties the upstream, the autoupdate service and the
//! HTTP server together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{
    autoupdate::{Autoupdate, Restricter},
    config::Config,
    datastore::{upstream::HttpUpstream, ChangeStream, Datastore, UpstreamReader},
    http::{Auth, HeaderAuth, HttpServer},
    metrics::Metrics,
    state::AppState,
    topic::Topic,
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then
/// shutdown.
pub async fn run_with_config_until_ctrl_c(
    config: Config,
    restricter: Arc<dyn Restricter>,
) -> Result<()> {
    let upstream = HttpUpstream::new(config.upstream.url.clone());
    let changes = upstream.changes();
    let auth = Arc::new(HeaderAuth {
        header: config.auth_header.clone(),
    });
    let server = Server::spawn(config, Arc::new(upstream), changes, auth, restricter).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await
}

/// The autoupdate server.
#[derive(Debug)]
pub struct Server {
    http_server: HttpServer,
    metrics_task: tokio::task::JoinHandle<Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This starts several background tasks: the change feed ingestion, the
    /// HTTP listener and, if configured, the metrics endpoint.
    pub async fn spawn(
        config: Config,
        upstream: Arc<dyn UpstreamReader>,
        changes: impl ChangeStream,
        auth: Arc<dyn Auth>,
        restricter: Arc<dyn Restricter>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let topic = Topic::new(config.topic.retain);
        let datastore = Datastore::new(upstream, changes, topic, metrics.clone());
        let autoupdate = Autoupdate::new(datastore, restricter, metrics.clone());
        let state = AppState {
            autoupdate,
            auth,
            metrics: metrics.clone(),
        };

        let metrics_addr = config.metrics_addr;
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                let mut registry = iroh_metrics::Registry::default();
                registry.register(metrics);
                iroh_metrics::service::start_metrics_server(addr, Arc::new(registry)).await?;
            }
            Ok(())
        });

        let http_server = HttpServer::spawn(config.http, state).await?;
        Ok(Self {
            http_server,
            metrics_task,
        })
    }

    /// The bound address of the HTTP listener.
    pub fn addr(&self) -> SocketAddr {
        self.http_server.addr()
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        self.http_server.shutdown().await
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails.
    pub async fn run_until_done(self) -> Result<()> {
        let res = self.http_server.run_until_done().await;
        self.metrics_task.abort();
        res
    }

    /// Spawn a server suitable for testing.
    ///
    /// This serves the given in-memory upstream on a localhost port picked by
    /// the OS and authenticates every request as `uid`.  It returns the
    /// server handle and the base URL clients should talk to.
    #[cfg(test)]
    pub(crate) async fn spawn_for_tests(
        upstream: crate::datastore::upstream::MemoryUpstream,
        restricter: Arc<dyn Restricter>,
        uid: u64,
    ) -> Result<(Self, url::Url)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::http::StaticAuth;

        let mut config = Config::default();
        config.http.port = 0;
        config.http.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.metrics_addr = None;

        let changes = upstream.changes();
        let server = Self::spawn(
            config,
            Arc::new(upstream),
            changes,
            Arc::new(StaticAuth(uid)),
            restricter,
        )
        .await?;
        let url = format!("http://{}/", server.addr())
            .parse()
            .expect("valid url");
        Ok((server, url))
    }
}
