//! Read-through facade over the upstream datastore.
//!
//! [`Datastore::get`] serves values through the in-process [`Cache`], asking
//! the upstream only for keys that are not resident.  A background task
//! ingests the upstream change feed and, per batch, writes the new values
//! into the cache *before* publishing the keys on the [`Topic`], so a woken
//! subscriber never reads a cache older than the event it was woken by.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, warn};

use crate::{metrics::Metrics, topic::Topic};

mod cache;
pub mod upstream;

pub use self::cache::Cache;

/// How long to wait before reading the change feed again after an error.
const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

/// Reads values from the upstream datastore.
#[async_trait]
pub trait UpstreamReader: Debug + Send + Sync + 'static {
    /// Returns the values for `keys`.  Keys missing from the result do not
    /// exist upstream; that is not an error.
    async fn get(&self, keys: Vec<String>) -> Result<HashMap<String, Bytes>>;
}

/// Delivers batches of changed keys with their new values.
///
/// Implementations reconnect on their own.  An error means a batch may have
/// been lost and the consumer has to resynchronize.
#[async_trait]
pub trait ChangeStream: Debug + Send + 'static {
    /// Waits for the next change batch.  `None` values mark deleted keys.
    async fn next(&mut self) -> Result<HashMap<String, Option<Bytes>>>;
}

/// Cached view of the upstream datastore.
///
/// Cloning shares the cache, the topic and the ingest task.
#[derive(Debug, Clone)]
pub struct Datastore {
    cache: Cache,
    topic: Topic,
    upstream: Arc<dyn UpstreamReader>,
    /// Every key ever requested; published wholesale when a change feed
    /// interruption may have lost updates.
    seen: Arc<Mutex<HashSet<String>>>,
    metrics: Arc<Metrics>,
    _ingest: Arc<IngestGuard>,
}

impl Datastore {
    /// Creates the facade and spawns the change-feed ingest task.
    pub fn new(
        upstream: Arc<dyn UpstreamReader>,
        changes: impl ChangeStream,
        topic: Topic,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = Cache::new();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();
        let ingest = Ingest {
            changes,
            cache: cache.clone(),
            topic: topic.clone(),
            seen: seen.clone(),
            cancel: cancel.clone(),
            metrics: metrics.clone(),
        };
        let task = tokio::spawn(async move { ingest.run().await });
        Self {
            cache,
            topic,
            upstream,
            seen,
            metrics,
            _ingest: Arc::new(IngestGuard {
                cancel,
                _task: AbortOnDropHandle::new(task),
            }),
        }
    }

    /// The topic carrying one event per upstream change batch.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Returns the values for `keys` in input order, reading through the
    /// cache.  Absent keys yield `None`.
    pub async fn get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.seen.lock().extend(keys.iter().cloned());
        let upstream = self.upstream.clone();
        let metrics = self.metrics.clone();
        self.cache
            .get_or_set(keys, move |missing| {
                let upstream = upstream.clone();
                let metrics = metrics.clone();
                async move {
                    metrics.upstream_fetches.inc();
                    metrics.upstream_fetched_keys.inc_by(missing.len() as u64);
                    upstream.get(missing).await
                }
            })
            .await
    }
}

#[derive(Debug)]
struct IngestGuard {
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Ingest<S> {
    changes: S,
    cache: Cache,
    topic: Topic,
    seen: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl<S: ChangeStream> Ingest<S> {
    async fn run(mut self) {
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => return,
                batch = self.changes.next() => batch,
            };
            match batch {
                Ok(updates) => {
                    if updates.is_empty() {
                        continue;
                    }
                    let keys: Vec<String> = updates.keys().cloned().collect();
                    debug!(keys = keys.len(), "upstream change batch");
                    self.metrics.change_events.inc();
                    // Invalidate before publishing, the order subscribers
                    // rely on.
                    self.cache.set_if_exist(updates);
                    self.topic.publish(keys);
                }
                Err(err) => {
                    warn!("change feed interrupted: {err:#}");
                    self.metrics.change_feed_errors.inc();
                    // An update may have been lost: drop the cache and treat
                    // every key handed out so far as changed.
                    self.cache.reset();
                    let seen: Vec<String> = self.seen.lock().iter().cloned().collect();
                    if !seen.is_empty() {
                        self.topic.publish(seen);
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(RESYNC_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::upstream::MemoryUpstream;
    use super::*;

    fn store() -> (Datastore, MemoryUpstream) {
        let upstream = MemoryUpstream::new();
        let changes = upstream.changes();
        let datastore = Datastore::new(
            Arc::new(upstream.clone()),
            changes,
            Topic::default(),
            Arc::new(Metrics::default()),
        );
        (datastore, upstream)
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn value(v: &str) -> Option<Bytes> {
        Some(Bytes::from(v.to_string()))
    }

    #[tokio::test]
    async fn get_reads_through_the_cache() {
        let (datastore, upstream) = store();
        upstream.seed("user/1/name", r#""ada""#);

        let got = datastore.get(&keys(&["user/1/name"])).await.unwrap();
        assert_eq!(got[0], value(r#""ada""#));

        // A silent upstream edit is not seen, the cached value wins.
        upstream.seed("user/1/name", r#""grace""#);
        let got = datastore.get(&keys(&["user/1/name"])).await.unwrap();
        assert_eq!(got[0], value(r#""ada""#));
    }

    #[tokio::test]
    async fn change_batch_is_applied_before_publish() {
        let (datastore, upstream) = store();
        upstream.seed("user/1/name", r#""ada""#);
        datastore.get(&keys(&["user/1/name"])).await.unwrap();

        let cursor = datastore.topic().last_cursor();
        upstream.write(
            [("user/1/name".to_string(), value(r#""grace""#))]
                .into_iter()
                .collect(),
        );

        let (changed, _) = timeout(Duration::from_secs(1), datastore.topic().receive(cursor))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed, keys(&["user/1/name"]));
        // Waking implies the cache already holds the new value.
        let got = datastore.get(&keys(&["user/1/name"])).await.unwrap();
        assert_eq!(got[0], value(r#""grace""#));
    }

    #[tokio::test]
    async fn feed_interruption_invalidates_everything_seen() {
        let (datastore, upstream) = store();
        upstream.seed("user/1/name", r#""ada""#);
        datastore.get(&keys(&["user/1/name"])).await.unwrap();

        let cursor = datastore.topic().last_cursor();
        upstream.seed("user/1/name", r#""grace""#);
        upstream.interrupt();

        let (changed, _) = timeout(Duration::from_secs(1), datastore.topic().receive(cursor))
            .await
            .unwrap()
            .unwrap();
        assert!(changed.contains(&"user/1/name".to_string()));
        // The cache was reset, the next read sees the upstream edit.
        let got = datastore.get(&keys(&["user/1/name"])).await.unwrap();
        assert_eq!(got[0], value(r#""grace""#));
    }
}
