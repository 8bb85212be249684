//! In-memory key cache with coalesced fetches.
//!
//! Values are raw JSON bytes keyed by `collection/id/field` strings.  A miss
//! triggers one fetch no matter how many callers ask for the key at the same
//! time, and an external write arriving while that fetch is in flight wins
//! over the fetch result.  Entries are only created on demand, so the
//! resident set is bounded by what subscribers actually asked for.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

/// Map from datastore key to raw JSON value.
///
/// `None` values mark keys that do not exist upstream, which is different
/// from a key that was never requested (no entry at all).  Cloning shares
/// the underlying map.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug)]
enum Entry {
    /// A committed value; `None` when the key does not exist upstream.
    Ready(Option<Bytes>),
    /// A fetch for this key is in flight.
    Pending(Pending),
}

#[derive(Debug)]
struct Pending {
    /// Flipped to `true` when the fetch commits.  Dropped unset when the
    /// fetch fails, telling waiters to fetch for themselves.
    done: watch::Sender<bool>,
    update: Option<PendingUpdate>,
}

/// What happened to a key while its fetch was in flight.
#[derive(Debug)]
enum PendingUpdate {
    /// An external write arrived: commit this value, not the fetched one.
    Value(Option<Bytes>),
    /// The whole cache was reset: the fetched value must not be kept.
    Discard,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the values for `keys` in input order, fetching the ones that
    /// are not resident with `fetch`.
    ///
    /// Concurrent calls for the same missing key share one fetch.  The fetch
    /// future runs on its own task, so dropping this future never aborts a
    /// fetch other callers wait on.  A fetch error is returned to the call
    /// that started the fetch only; waiters retry with their own fetch.
    /// Fetched keys that were not asked for are dropped.
    pub async fn get_or_set<F, Fut>(&self, keys: &[String], fetch: F) -> Result<Vec<Option<Bytes>>>
    where
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, Bytes>>> + Send + 'static,
    {
        let mut values: HashMap<String, Option<Bytes>> = HashMap::with_capacity(keys.len());
        loop {
            let mut missing: Vec<String> = Vec::new();
            let mut waiting: Vec<watch::Receiver<bool>> = Vec::new();
            {
                let mut entries = self.entries.lock();
                let mut seen: HashSet<&str> = HashSet::with_capacity(keys.len());
                for key in keys {
                    if values.contains_key(key) || !seen.insert(key.as_str()) {
                        continue;
                    }
                    match entries.get(key) {
                        Some(Entry::Ready(value)) => {
                            values.insert(key.clone(), value.clone());
                        }
                        Some(Entry::Pending(pending)) => {
                            waiting.push(pending.done.subscribe());
                        }
                        None => {
                            let (done, _) = watch::channel(false);
                            entries.insert(
                                key.clone(),
                                Entry::Pending(Pending { done, update: None }),
                            );
                            missing.push(key.clone());
                        }
                    }
                }
            }

            if missing.is_empty() && waiting.is_empty() {
                break;
            }

            if !missing.is_empty() {
                let fetched = self.run_fetch(missing.clone(), fetch(missing)).await?;
                values.extend(fetched);
            }

            for mut done in waiting {
                // Either outcome makes progress: on commit the entry is
                // Ready, on a failed fetch it is gone and the next pass
                // fetches it anew.
                done.wait_for(|done| *done).await.ok();
            }
        }

        Ok(keys
            .iter()
            .map(|key| values.get(key).cloned().unwrap_or(None))
            .collect())
    }

    /// Writes `updates` into entries that already exist; `None` marks a key
    /// deleted upstream.
    ///
    /// Keys that were never requested are ignored.  A key with a fetch in
    /// flight records the value, and the commit uses it in place of the
    /// fetch result.
    pub fn set_if_exist(&self, updates: HashMap<String, Option<Bytes>>) {
        let mut entries = self.entries.lock();
        for (key, value) in updates {
            match entries.get_mut(&key) {
                Some(Entry::Ready(current)) => *current = value,
                Some(Entry::Pending(pending)) => {
                    pending.update = Some(PendingUpdate::Value(value));
                }
                None => {}
            }
        }
    }

    /// Drops every committed value and marks in-flight fetches as outdated.
    ///
    /// Used after the upstream change feed was interrupted, when any resident
    /// value may be stale.
    pub fn reset(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| match entry {
            Entry::Ready(_) => false,
            Entry::Pending(pending) => {
                pending.update = Some(PendingUpdate::Discard);
                true
            }
        });
    }

    /// Runs the fetch for `keys` on its own task and hands the committed
    /// values back to the triggering caller.
    async fn run_fetch(
        &self,
        keys: Vec<String>,
        fut: impl Future<Output = Result<HashMap<String, Bytes>>> + Send + 'static,
    ) -> Result<HashMap<String, Option<Bytes>>> {
        let (res_tx, res_rx) = oneshot::channel();
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let committed = commit(&entries, keys, fut.await);
            // The caller may be gone; the entries are settled regardless.
            res_tx.send(committed).ok();
        });
        res_rx.await.map_err(|_| anyhow!("fetch task failed"))?
    }
}

/// Settles the pending entries for `keys` with the fetch outcome, under the
/// lock.  Returns what the triggering caller should see.
fn commit(
    entries: &Mutex<HashMap<String, Entry>>,
    keys: Vec<String>,
    res: Result<HashMap<String, Bytes>>,
) -> Result<HashMap<String, Option<Bytes>>> {
    let mut entries = entries.lock();
    match res {
        Ok(mut fetched) => {
            let mut committed = HashMap::with_capacity(keys.len());
            for key in keys {
                let fetched_value = fetched.remove(&key);
                let pending = match entries.remove(&key) {
                    Some(Entry::Pending(pending)) => pending,
                    other => {
                        // Not ours to settle anymore.
                        if let Some(entry) = other {
                            entries.insert(key.clone(), entry);
                        }
                        committed.insert(key, fetched_value);
                        continue;
                    }
                };
                pending.done.send_replace(true);
                let value = match pending.update {
                    None => fetched_value,
                    Some(PendingUpdate::Value(value)) => value,
                    Some(PendingUpdate::Discard) => {
                        // The caller still gets what it fetched, but the
                        // cache keeps nothing.
                        committed.insert(key, fetched_value);
                        continue;
                    }
                };
                entries.insert(key.clone(), Entry::Ready(value.clone()));
                committed.insert(key, value);
            }
            Ok(committed)
        }
        Err(err) => {
            for key in keys {
                match entries.remove(&key) {
                    // Dropping the unset handle tells waiters to retry.
                    Some(Entry::Pending(_)) => {}
                    Some(entry) => {
                        entries.insert(key, entry);
                    }
                    None => {}
                }
            }
            Err(err)
        }
    }
}
