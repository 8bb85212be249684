//! The autoupdate service: subscriptions that push fresh values.
//!
//! A [`Subscription`] runs one connection's loop: expand the request set to
//! flat keys, fetch the values through the datastore facade, apply the
//! [`Restricter`], emit what changed and block on the change topic until a
//! published key intersects the set.  Relation fields are re-expanded on
//! every wakeup because they may point at different objects by then.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use crate::{datastore::Datastore, metrics::Metrics, topic::LostPosition};

pub mod keyrequest;

use self::keyrequest::{expand, KeyRequest, RequestError};

/// Redacts values a user must not see.
///
/// Applied on every emission, so permission changes take effect with the next
/// push.  Implementations are pure per call; an error ends the subscription.
pub trait Restricter: Debug + Send + Sync + 'static {
    /// Returns the restricted values, aligned with `keys`.  A hidden value
    /// becomes absent.
    fn restrict(
        &self,
        uid: u64,
        keys: &[String],
        values: Vec<Option<Bytes>>,
    ) -> Result<Vec<Option<Bytes>>>;
}

/// Restricter that lets every value through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Restricter for AllowAll {
    fn restrict(
        &self,
        _uid: u64,
        _keys: &[String],
        values: Vec<Option<Bytes>>,
    ) -> Result<Vec<Option<Bytes>>> {
        Ok(values)
    }
}

/// What a connection subscribed to.
#[derive(Debug, Clone)]
pub enum RequestSet {
    /// A fixed list of plain keys.
    Keys(Vec<String>),
    /// Structured requests whose relations re-expand on every change.
    Requests(Vec<KeyRequest>),
}

impl RequestSet {
    async fn expand(&self, datastore: &Datastore) -> Result<Vec<String>, RequestError> {
        match self {
            RequestSet::Keys(keys) => Ok(keys.clone()),
            RequestSet::Requests(requests) => expand(requests, datastore).await,
        }
    }
}

/// Why a subscription ended.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The request set no longer matches the data.
    #[error(transparent)]
    Request(#[from] RequestError),
    /// Reading values from the upstream failed.
    #[error("fetching values: {0}")]
    Fetch(#[source] anyhow::Error),
    /// The restricter rejected the emission.
    #[error("restricting values: {0}")]
    Restrict(#[source] anyhow::Error),
}

/// Handle to the autoupdate service.
#[derive(Debug, Clone)]
pub struct Autoupdate {
    datastore: Datastore,
    restricter: Arc<dyn Restricter>,
    metrics: Arc<Metrics>,
}

impl Autoupdate {
    /// Creates the service on top of `datastore`.
    pub fn new(datastore: Datastore, restricter: Arc<dyn Restricter>, metrics: Arc<Metrics>) -> Self {
        Self {
            datastore,
            restricter,
            metrics,
        }
    }

    /// Opens a subscription for `uid`.
    ///
    /// The first payload is the complete snapshot, every further payload
    /// carries only the keys whose restricted value changed.  Dropping the
    /// subscription closes it.
    pub fn subscribe(&self, uid: u64, requests: RequestSet) -> Subscription {
        self.metrics.connections_opened.inc();
        Subscription {
            service: self.clone(),
            uid,
            requests,
            keys: Vec::new(),
            cursor: 0,
            emitted: HashMap::new(),
            first: true,
        }
    }
}

/// One connection's stream of payloads.
#[derive(Debug)]
pub struct Subscription {
    service: Autoupdate,
    uid: u64,
    requests: RequestSet,
    /// Expanded key set of the last iteration.
    keys: Vec<String>,
    /// Last seen topic cursor, always sampled before the fetch it guards.
    cursor: u64,
    /// Last emitted (restricted) value per key.
    emitted: HashMap<String, Option<Bytes>>,
    first: bool,
}

impl Subscription {
    /// Waits for and builds the next payload.
    ///
    /// A payload is one JSON object mapping keys to raw values, `null` for a
    /// key that does not exist, terminated by a newline.  Wakeups whose
    /// values are unchanged after restriction produce no payload and keep
    /// waiting.
    pub async fn next_payload(&mut self) -> Result<Bytes, SubscriptionError> {
        loop {
            if self.first {
                self.cursor = self.service.datastore.topic().last_cursor();
            } else {
                self.wait_for_change().await;
            }

            let datastore = &self.service.datastore;
            let keys = self.requests.expand(datastore).await?;
            let values = datastore
                .get(&keys)
                .await
                .map_err(SubscriptionError::Fetch)?;
            let values = self
                .service
                .restricter
                .restrict(self.uid, &keys, values)
                .map_err(SubscriptionError::Restrict)?;

            let mut changed: BTreeMap<String, Option<Bytes>> = BTreeMap::new();
            let mut emitted = HashMap::with_capacity(keys.len());
            for (key, value) in keys.iter().zip(values) {
                if self.first || self.emitted.get(key) != Some(&value) {
                    changed.insert(key.clone(), value.clone());
                }
                emitted.insert(key.clone(), value);
            }
            let was_first = self.first;
            self.first = false;
            self.emitted = emitted;
            self.keys = keys;

            if changed.is_empty() && !was_first {
                continue;
            }
            debug!(uid = self.uid, keys = changed.len(), "payload");
            self.service.metrics.payloads_sent.inc();
            return Ok(encode_payload(&changed));
        }
    }

    /// Blocks until a published event intersects the key set.
    async fn wait_for_change(&mut self) {
        let keys: HashSet<&str> = self.keys.iter().map(String::as_str).collect();
        loop {
            match self.service.datastore.topic().receive(self.cursor).await {
                Ok((changed, cursor)) => {
                    self.cursor = cursor;
                    if changed.iter().any(|key| keys.contains(key.as_str())) {
                        return;
                    }
                }
                Err(LostPosition) => {
                    // Too far behind to know what changed: re-emit everything.
                    self.cursor = self.service.datastore.topic().last_cursor();
                    self.emitted.clear();
                    return;
                }
            }
        }
    }
}

/// Encodes one payload object.  Values are raw JSON and spliced in verbatim.
fn encode_payload(values: &BTreeMap<String, Option<Bytes>>) -> Bytes {
    let mut out = Vec::with_capacity(values.len() * 32 + 3);
    out.push(b'{');
    for (i, (key, value)) in values.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend(serde_json::to_vec(key).expect("strings always serialize"));
        out.push(b':');
        match value {
            Some(value) => out.extend_from_slice(value),
            None => out.extend_from_slice(b"null"),
        }
    }
    out.extend_from_slice(b"}\n");
    Bytes::from(out)
}
