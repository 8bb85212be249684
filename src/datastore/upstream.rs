//! Upstream datastore transports.
//!
//! [`HttpUpstream`] talks to the datastore's HTTP API and is what the server
//! binary uses.  [`MemoryUpstream`] keeps everything in process and backs the
//! tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{ChangeStream, UpstreamReader};

/// Upstream reader talking to the datastore's HTTP API.
///
/// Values are read with `POST <base>/get`, the change feed is a streamed
/// `GET <base>/changes` of newline-delimited JSON batches.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: Url,
}

#[derive(Serialize)]
struct GetRequest<'a> {
    keys: &'a [String],
}

impl HttpUpstream {
    /// Creates a reader for the datastore at `url`.
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Opens the change feed of this upstream.
    ///
    /// The feed connects lazily and reconnects on the next
    /// [`ChangeStream::next`] call after an error.
    pub fn changes(&self) -> HttpChangeStream {
        HttpChangeStream {
            client: self.client.clone(),
            url: self.url.clone(),
            connection: None,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl UpstreamReader for HttpUpstream {
    async fn get(&self, keys: Vec<String>) -> Result<HashMap<String, Bytes>> {
        let url = self.url.join("get").context("building upstream url")?;
        let resp = self
            .client
            .post(url)
            .json(&GetRequest { keys: &keys })
            .send()
            .await
            .context("requesting keys from the upstream")?;
        if !resp.status().is_success() {
            bail!("upstream responded with {}", resp.status());
        }
        let body: HashMap<String, Option<Box<RawValue>>> = resp
            .json()
            .await
            .context("invalid upstream response body")?;
        Ok(body
            .into_iter()
            .filter_map(|(key, value)| {
                value.map(|value| (key, Bytes::from(value.get().to_owned())))
            })
            .collect())
    }
}

/// Change feed of a [`HttpUpstream`].
#[derive(Debug)]
pub struct HttpChangeStream {
    client: reqwest::Client,
    url: Url,
    connection: Option<reqwest::Response>,
    buffer: Vec<u8>,
}

impl HttpChangeStream {
    /// Takes the next complete line out of the receive buffer.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    async fn connect(&mut self) -> Result<&mut reqwest::Response> {
        if self.connection.is_none() {
            let url = self.url.join("changes").context("building feed url")?;
            debug!(%url, "connecting to the change feed");
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .context("connecting to the change feed")?;
            if !resp.status().is_success() {
                bail!("change feed responded with {}", resp.status());
            }
            self.buffer.clear();
            self.connection = Some(resp);
        }
        Ok(self.connection.as_mut().expect("connection set above"))
    }
}

#[async_trait]
impl ChangeStream for HttpChangeStream {
    async fn next(&mut self) -> Result<HashMap<String, Option<Bytes>>> {
        loop {
            if let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let batch: HashMap<String, Option<Box<RawValue>>> =
                    serde_json::from_slice(&line).context("invalid change batch")?;
                return Ok(batch
                    .into_iter()
                    .map(|(key, value)| {
                        (key, value.map(|value| Bytes::from(value.get().to_owned())))
                    })
                    .collect());
            }
            let connection = self.connect().await?;
            match connection.chunk().await {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => {
                    self.connection = None;
                    bail!("change feed closed");
                }
                Err(err) => {
                    self.connection = None;
                    return Err(err).context("reading the change feed");
                }
            }
        }
    }
}

/// In-memory upstream for tests and local runs.
///
/// Cloning shares the data and the open change feeds.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpstream {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: HashMap<String, Bytes>,
    feeds: Vec<mpsc::UnboundedSender<Result<HashMap<String, Option<Bytes>>>>>,
}

impl MemoryUpstream {
    /// Creates an empty upstream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value without announcing a change; used to seed data.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.inner.lock().data.insert(key.into(), value.into());
    }

    /// Applies `updates` and delivers them as one change batch.  `None`
    /// deletes the key.
    pub fn write(&self, updates: HashMap<String, Option<Bytes>>) {
        let mut inner = self.inner.lock();
        for (key, value) in &updates {
            match value {
                Some(value) => {
                    inner.data.insert(key.clone(), value.clone());
                }
                None => {
                    inner.data.remove(key);
                }
            }
        }
        inner
            .feeds
            .retain(|feed| feed.send(Ok(updates.clone())).is_ok());
    }

    /// Fails every open change feed once, like a dropped upstream
    /// connection.  The feeds keep delivering afterwards.
    pub fn interrupt(&self) {
        self.inner
            .lock()
            .feeds
            .retain(|feed| feed.send(Err(anyhow!("change feed interrupted"))).is_ok());
    }

    /// Opens a change feed.
    pub fn changes(&self) -> MemoryChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().feeds.push(tx);
        MemoryChangeStream { feed: rx }
    }
}

#[async_trait]
impl UpstreamReader for MemoryUpstream {
    async fn get(&self, keys: Vec<String>) -> Result<HashMap<String, Bytes>> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter_map(|key| inner.data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }
}

/// Change feed of a [`MemoryUpstream`].
#[derive(Debug)]
pub struct MemoryChangeStream {
    feed: mpsc::UnboundedReceiver<Result<HashMap<String, Option<Bytes>>>>,
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next(&mut self) -> Result<HashMap<String, Option<Bytes>>> {
        match self.feed.recv().await {
            Some(batch) => batch,
            // The upstream is gone, nothing will change anymore.
            None => std::future::pending().await,
        }
    }
}
