//! Broadcast log of changed keys.
//!
//! The datastore facade publishes one event per upstream change batch, and
//! every subscriber blocks in [`Topic::receive`] until something was published
//! past its cursor.  Only the last few events are retained; a receiver that
//! fell further behind gets [`LostPosition`] and has to treat all of its keys
//! as changed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Number of events kept for slow receivers by default.
pub const DEFAULT_RETAIN: usize = 1024;

/// The cursor passed to [`Topic::receive`] is older than the oldest retained
/// event, so changes may have been missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cursor is no longer retained")]
pub struct LostPosition;

/// An append-only sequence of changed-key events.
///
/// Cursors are `u64` positions handed out by [`Topic::publish`] and
/// [`Topic::last_cursor`]; every published event gets the next position.
/// `0` is reserved as the "from now on" sentinel and is never handed out,
/// so a sampled cursor always marks an exact spot in the log.  Cloning
/// shares the underlying log.
#[derive(Debug, Clone)]
pub struct Topic {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Carries the cursor of the newest event, waking all receivers.
    notify: watch::Sender<u64>,
}

#[derive(Debug)]
struct State {
    events: VecDeque<Vec<String>>,
    /// Cursor of `events.front()`.  The empty topic sits at position 1, so
    /// the first event gets cursor 2.
    first: u64,
    retain: usize,
}

impl State {
    fn latest(&self) -> u64 {
        self.first + self.events.len() as u64 - 1
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new(DEFAULT_RETAIN)
    }
}

impl Topic {
    /// Creates a topic retaining the `retain` most recent events.
    pub fn new(retain: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    events: VecDeque::new(),
                    first: 2,
                    retain: retain.max(1),
                }),
                notify,
            }),
        }
    }

    /// Appends one event and wakes all receivers.  Returns the event's cursor.
    pub fn publish(&self, keys: Vec<String>) -> u64 {
        let cursor = {
            let mut state = self.shared.state.lock();
            state.events.push_back(keys);
            while state.events.len() > state.retain {
                state.events.pop_front();
                state.first += 1;
            }
            state.latest()
        };
        self.shared.notify.send_replace(cursor);
        cursor
    }

    /// The position of the newest event, usable as `since` for
    /// [`Topic::receive`] to not miss anything published after this call.
    pub fn last_cursor(&self) -> u64 {
        self.shared.state.lock().latest()
    }

    /// Returns all keys published after `since` together with the new cursor,
    /// waiting until there is at least one event.
    ///
    /// `since` of `0` means "from now on": history is not replayed.  Keys are
    /// returned as published, duplicates included; callers intersect against
    /// their own key set.  Dropping the future has no effect on the log.
    pub async fn receive(&self, mut since: u64) -> Result<(Vec<String>, u64), LostPosition> {
        let mut notify = self.shared.notify.subscribe();
        loop {
            {
                let state = self.shared.state.lock();
                let latest = state.latest();
                if since == 0 {
                    since = latest;
                } else if since + 1 < state.first {
                    return Err(LostPosition);
                }
                if latest > since {
                    let start = (since + 1 - state.first) as usize;
                    let mut keys = Vec::new();
                    for event in state.events.iter().skip(start) {
                        keys.extend(event.iter().cloned());
                    }
                    return Ok((keys, latest));
                }
            }
            // The sender lives next to the state, it cannot be gone while
            // `self` borrows the topic.
            notify.changed().await.ok();
        }
    }
}
