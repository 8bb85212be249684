//! HTTP server part of the autoupdate service.
//!
//! Two endpoints open subscriptions: `/system/autoupdate/keys` takes plain
//! keys in the query string, `/system/autoupdate` takes structured key
//! requests in the body.  Both answer with a stream of newline-delimited
//! JSON payloads that stays open until the client goes away.

use std::fmt::Debug;
use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

mod error;

pub use self::error::AppError;

use crate::{
    autoupdate::{keyrequest, RequestSet},
    state::AppState,
};

/// Config for the HTTP server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to.
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset).
    pub bind_addr: Option<IpAddr>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 9012,
            bind_addr: None,
        }
    }
}

/// Resolves the requesting user.
pub trait Auth: Debug + Send + Sync + 'static {
    /// Returns the user id for a request, `0` being the anonymous user.
    fn authenticate(&self, headers: &HeaderMap) -> Result<u64>;
}

/// Auth that reads the user id from a trusted header, set by a proxy in
/// front of this service.  Requests without the header are anonymous.
#[derive(Debug, Clone)]
pub struct HeaderAuth {
    /// Header carrying the numeric user id.
    pub header: String,
}

impl Default for HeaderAuth {
    fn default() -> Self {
        Self {
            header: "x-user-id".to_string(),
        }
    }
}

impl Auth for HeaderAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<u64> {
        let Some(value) = headers.get(self.header.as_str()) else {
            return Ok(0);
        };
        value
            .to_str()
            .context("user id header is not ascii")?
            .parse()
            .context("user id header is not a number")
    }
}

/// Auth that assigns every request the same user.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuth(
    /// The fixed user id.
    pub u64,
);

impl Auth for StaticAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<u64> {
        Ok(self.0)
    }
}

/// The HTTP server half of the service.
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    addr: SocketAddr,
}

impl HttpServer {
    /// Binds the listener and spawns the serve task.
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer> {
        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let app = create_app(state);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("binding to {bind_addr}"))?;
        let addr = listener.local_addr().context("reading bound address")?;
        let mut tasks = JoinSet::new();
        tasks.spawn(axum::serve(listener, app.into_make_service()).into_future());
        info!("HTTP server listening on {addr}");
        Ok(HttpServer { tasks, addr })
    }

    /// The bound address of the listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tasks.abort_all();
        self.run_until_done().await
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "server task failed");
                    final_res = Err(anyhow::Error::new(err).context("server task"));
                }
                Err(err) => {
                    warn!(?err, "server task panicked");
                    final_res = Err(anyhow::Error::new(err).context("joining server task"));
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(cors::Any);

    Router::new()
        .route("/system/autoupdate", get(autoupdate))
        .route("/system/autoupdate/keys", get(autoupdate_keys))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health check response.
#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /system/autoupdate` with a body of structured key requests.
async fn autoupdate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers)?;
    let requests = keyrequest::parse(&body)?;
    stream_response(state, uid, RequestSet::Requests(requests)).await
}

/// `GET /system/autoupdate/keys?<key,key,…>` with plain datastore keys.
async fn autoupdate_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers)?;
    let keys: Vec<String> = query
        .unwrap_or_default()
        .split(',')
        .filter(|key| !key.is_empty())
        .map(|key| key.to_string())
        .collect();
    keyrequest::validate_keys(&keys)?;
    stream_response(state, uid, RequestSet::Keys(keys)).await
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<u64, AppError> {
    state
        .auth
        .authenticate(headers)
        .map_err(|err| AppError::unauthorized(format!("{err:#}")))
}

/// Opens the subscription and streams its payloads.
///
/// The first payload is awaited before answering, so an invalid request set
/// fails with a proper status code instead of a broken stream.
async fn stream_response(
    state: AppState,
    uid: u64,
    requests: RequestSet,
) -> Result<Response, AppError> {
    let mut subscription = state.autoupdate.subscribe(uid, requests);
    let first = subscription.next_payload().await.map_err(AppError::from)?;

    let stream = async_stream::stream! {
        yield Ok::<Bytes, std::convert::Infallible>(first);
        loop {
            match subscription.next_payload().await {
                Ok(payload) => yield Ok(payload),
                Err(err) => {
                    warn!(uid, "subscription ended: {err:#}");
                    yield Ok(AppError::from(err).to_body());
                    break;
                }
            }
        }
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}
