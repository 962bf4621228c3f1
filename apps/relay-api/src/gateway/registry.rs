//! Subscription registry: appKey → event → channel → subscribed connections.
//!
//! The nested maps never hold an empty container. Every mutation either leaves
//! a populated leaf or removes the whole path, so a miss on any tuple is a
//! plain "not found" at whichever level it falls out.
//!
//! A per-connection index of owned tuples lives under the same lock so that
//! dropping a connection costs O(tuples it held), not O(registry size).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::connection::{ConnectionHandle, ConnectionId};

/// The (appKey, event, channel) tuple identifying one subscription bucket.
///
/// `event` is expected in normalized form (see `validator::normalize_event`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub app_key: String,
    pub event: String,
    pub channel: String,
}

impl SubscriptionKey {
    pub fn new(
        app_key: impl Into<String>,
        event: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            event: event.into(),
            channel: channel.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app_key, self.event, self.channel)
    }
}

/// One connection's membership in one bucket.
#[derive(Debug, Clone)]
pub struct Subscription {
    connection: Arc<ConnectionHandle>,
    created_at: Instant,
    last_activity_at: Instant,
}

impl Subscription {
    fn new(connection: Arc<ConnectionHandle>, now: Instant) -> Self {
        Self {
            connection,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }
}

/// What a traversal visitor wants done with the entry it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Evict,
}

type Subscribers = HashMap<ConnectionId, Subscription>;
type Channels = HashMap<String, Subscribers>;
type Events = HashMap<String, Channels>;

#[derive(Default)]
struct Inner {
    apps: HashMap<String, Events>,
    owned: HashMap<ConnectionId, HashSet<SubscriptionKey>>,
}

/// Process-wide subscription state, guarded by one mutex.
///
/// Lock hold times are O(depth) for point operations. Callers never perform
/// I/O while the lock is held: `lookup` hands back a snapshot.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` for `key`. Returns `false` if the pair already existed,
    /// in which case nothing changes (not even the activity timestamp).
    pub fn add(&self, key: &SubscriptionKey, conn: &Arc<ConnectionHandle>) -> bool {
        let mut inner = self.inner.lock();
        let Inner { apps, owned } = &mut *inner;

        let subscribers = apps
            .entry(key.app_key.clone())
            .or_default()
            .entry(key.event.clone())
            .or_default()
            .entry(key.channel.clone())
            .or_default();

        if subscribers.contains_key(conn.id()) {
            return false;
        }

        subscribers.insert(
            conn.id().to_string(),
            Subscription::new(conn.clone(), Instant::now()),
        );
        owned
            .entry(conn.id().to_string())
            .or_default()
            .insert(key.clone());
        true
    }

    /// Remove one (connection, tuple) pair, pruning emptied ancestors.
    /// Returns whether anything was removed.
    pub fn remove(&self, key: &SubscriptionKey, conn_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Inner { apps, owned } = &mut *inner;

        let removed = remove_entry(apps, key, conn_id).is_some();
        if removed {
            forget_owned(owned, conn_id, key);
        }
        removed
    }

    /// Remove every subscription held by `conn_id`. Returns how many there were.
    pub fn remove_all(&self, conn_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let Inner { apps, owned } = &mut *inner;

        let Some(keys) = owned.remove(conn_id) else {
            return 0;
        };

        keys.iter()
            .filter(|key| remove_entry(apps, key, conn_id).is_some())
            .count()
    }

    /// Snapshot of the connections registered for `key`. Read-only: closed
    /// connections are returned as-is and left for the sweep to reap.
    pub fn lookup(&self, key: &SubscriptionKey) -> Vec<Arc<ConnectionHandle>> {
        let inner = self.inner.lock();
        inner
            .apps
            .get(&key.app_key)
            .and_then(|events| events.get(&key.event))
            .and_then(|channels| channels.get(&key.channel))
            .map(|subscribers| {
                subscribers
                    .values()
                    .map(|sub| sub.connection.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Refresh the activity timestamp of an existing pair. Returns whether the
    /// pair was found.
    pub fn touch(&self, key: &SubscriptionKey, conn_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .apps
            .get_mut(&key.app_key)
            .and_then(|events| events.get_mut(&key.event))
            .and_then(|channels| channels.get_mut(&key.channel))
            .and_then(|subscribers| subscribers.get_mut(conn_id))
        {
            Some(sub) => {
                sub.last_activity_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Tuples currently held by a connection.
    pub fn subscriptions_of(&self, conn_id: &str) -> Vec<SubscriptionKey> {
        self.inner
            .lock()
            .owned
            .get(conn_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Visit every subscription in the registry, evicting the ones the visitor
    /// flags. Holds the lock for the whole traversal; the sweep uses
    /// `for_each_subscription_at` instead to work one bucket at a time.
    pub fn for_each_subscription<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(&SubscriptionKey, &Subscription) -> Visit,
    {
        let mut inner = self.inner.lock();
        let Inner { apps, owned } = &mut *inner;

        let mut evicted = 0;
        apps.retain(|app_key, events| {
            evicted += visit_events(app_key, events, owned, &mut visitor);
            !events.is_empty()
        });
        evicted
    }

    /// Visit the subscriptions of a single bucket, evicting the ones the
    /// visitor flags and pruning the path if the bucket empties. The lock is
    /// held for this one bucket only.
    pub fn for_each_subscription_at<F>(&self, key: &SubscriptionKey, mut visitor: F) -> usize
    where
        F: FnMut(&SubscriptionKey, &Subscription) -> Visit,
    {
        let mut inner = self.inner.lock();
        let Inner { apps, owned } = &mut *inner;

        let Some(subscribers) = apps
            .get_mut(&key.app_key)
            .and_then(|events| events.get_mut(&key.event))
            .and_then(|channels| channels.get_mut(&key.channel))
        else {
            return 0;
        };

        let mut evicted = 0;
        subscribers.retain(|conn_id, sub| match visitor(key, sub) {
            Visit::Keep => true,
            Visit::Evict => {
                forget_owned(owned, conn_id, key);
                evicted += 1;
                false
            }
        });

        if subscribers.is_empty() {
            prune_empty_path(apps, key);
        }
        evicted
    }

    /// AppKeys that currently have at least one subscription.
    pub fn app_keys(&self) -> Vec<String> {
        self.inner.lock().apps.keys().cloned().collect()
    }

    /// Events with at least one subscription under `app_key`.
    pub fn events_of(&self, app_key: &str) -> Vec<String> {
        self.inner
            .lock()
            .apps
            .get(app_key)
            .map(|events| events.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Populated buckets under one (appKey, event) pair.
    pub fn buckets_of(&self, app_key: &str, event: &str) -> Vec<SubscriptionKey> {
        self.inner
            .lock()
            .apps
            .get(app_key)
            .and_then(|events| events.get(event))
            .map(|channels| {
                channels
                    .keys()
                    .map(|channel| SubscriptionKey::new(app_key, event, channel.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .lock()
            .owned
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().apps.is_empty()
    }
}

fn remove_entry(
    apps: &mut HashMap<String, Events>,
    key: &SubscriptionKey,
    conn_id: &str,
) -> Option<Subscription> {
    let removed = apps
        .get_mut(&key.app_key)?
        .get_mut(&key.event)?
        .get_mut(&key.channel)?
        .remove(conn_id);
    prune_empty_path(apps, key);
    removed
}

/// Drop whichever containers along `key`'s path are now empty.
fn prune_empty_path(apps: &mut HashMap<String, Events>, key: &SubscriptionKey) {
    let Some(events) = apps.get_mut(&key.app_key) else {
        return;
    };
    if let Some(channels) = events.get_mut(&key.event) {
        if channels.get(&key.channel).is_some_and(HashMap::is_empty) {
            channels.remove(&key.channel);
        }
        if channels.is_empty() {
            events.remove(&key.event);
        }
    }
    if events.is_empty() {
        apps.remove(&key.app_key);
    }
}

fn forget_owned(
    owned: &mut HashMap<ConnectionId, HashSet<SubscriptionKey>>,
    conn_id: &str,
    key: &SubscriptionKey,
) {
    if let Some(keys) = owned.get_mut(conn_id) {
        keys.remove(key);
        if keys.is_empty() {
            owned.remove(conn_id);
        }
    }
}

fn visit_events<F>(
    app_key: &str,
    events: &mut Events,
    owned: &mut HashMap<ConnectionId, HashSet<SubscriptionKey>>,
    visitor: &mut F,
) -> usize
where
    F: FnMut(&SubscriptionKey, &Subscription) -> Visit,
{
    let mut evicted = 0;

    events.retain(|event, channels| {
        channels.retain(|channel, subscribers| {
            let key = SubscriptionKey::new(app_key, event.as_str(), channel.as_str());
            subscribers.retain(|conn_id, sub| match visitor(&key, sub) {
                Visit::Keep => true,
                Visit::Evict => {
                    forget_owned(owned, conn_id, &key);
                    evicted += 1;
                    false
                }
            });
            !subscribers.is_empty()
        });
        !channels.is_empty()
    });

    evicted
}
