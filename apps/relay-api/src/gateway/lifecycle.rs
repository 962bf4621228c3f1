//! Connection lifecycle: connect → subscribe → close, plus the eviction sweep.
//!
//! Every connection moves through `Connected` → `Subscribed` → `Closed`.
//! Close handling drains the connection's subscriptions from the registry
//! before it returns, so nothing published afterwards can reach it.
//!
//! Lock order is connection entry (DashMap shard) → registry mutex. The sweep
//! and the dispatcher only ever take the registry mutex.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionHandle, ConnectionId};
use super::events::{to_text, ErrorFrame, CLOSE_NORMAL, SHUTDOWN_REASON};
use super::registry::{SubscriptionKey, SubscriptionRegistry, Visit};
use super::validator::{self, ValidationError};

/// Defaults match the relay's historical behaviour: sweep once a minute,
/// evict after an hour without a subscribe message.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_INACTIVE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, no subscriptions yet.
    Connected,
    /// Holds at least one subscription.
    Subscribed,
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub max_inactive: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            max_inactive: DEFAULT_MAX_INACTIVE,
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Subscribed(SubscriptionKey),
    /// The message failed validation; an error frame was sent back.
    Rejected(ValidationError),
    /// The connection is not tracked (already closed or never registered).
    Ignored,
}

struct TrackedConnection {
    handle: Arc<ConnectionHandle>,
    state: ConnectionState,
    connected_at: Instant,
}

pub struct ConnectionLifecycleManager {
    registry: Arc<SubscriptionRegistry>,
    connections: DashMap<ConnectionId, TrackedConnection>,
    sweep: SweepConfig,
    shutdown_token: CancellationToken,
    is_shutting_down: AtomicBool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLifecycleManager {
    /// Create the manager and start its background sweep. Must be called from
    /// within a Tokio runtime.
    pub fn new(registry: Arc<SubscriptionRegistry>, sweep: SweepConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry,
            connections: DashMap::new(),
            sweep,
            shutdown_token: CancellationToken::new(),
            is_shutting_down: AtomicBool::new(false),
            sweep_task: Mutex::new(None),
        });

        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner.run_sweeper().await;
        });
        *manager.sweep_task.lock() = Some(handle);

        tracing::debug!(
            interval_ms = sweep.interval.as_millis() as u64,
            max_inactive_ms = sweep.max_inactive.as_millis() as u64,
            "connection lifecycle manager started"
        );

        manager
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // ==================== Connection events ====================

    /// Start tracking a newly opened connection. Returns `false` (and tracks
    /// nothing) once shutdown has begun.
    pub fn on_connect(&self, conn: &Arc<ConnectionHandle>) -> bool {
        if self.is_shutting_down.load(Ordering::Acquire) {
            tracing::warn!(connection_id = %conn.id(), "rejecting connection during shutdown");
            return false;
        }

        self.connections.insert(
            conn.id().to_string(),
            TrackedConnection {
                handle: conn.clone(),
                state: ConnectionState::Connected,
                connected_at: Instant::now(),
            },
        );
        tracing::debug!(connection_id = %conn.id(), "connection opened");
        true
    }

    /// Handle one inbound message. A malformed message is answered with an
    /// error frame and never closes the connection.
    pub fn on_message(&self, conn: &Arc<ConnectionHandle>, raw: &[u8]) -> MessageOutcome {
        let request = match validator::parse_subscribe(raw) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(connection_id = %conn.id(), error = %err, "rejected subscribe message");
                if let Some(text) = to_text(&ErrorFrame::new(err.to_string())) {
                    conn.send_text(text);
                }
                return MessageOutcome::Rejected(err);
            }
        };

        // Holding the entry keeps a concurrent close from slipping in between
        // the state check and the registry insert.
        let Some(mut tracked) = self.connections.get_mut(conn.id()) else {
            return MessageOutcome::Ignored;
        };

        let key = request.key();
        if self.registry.add(&key, conn) {
            tracing::info!(
                connection_id = %conn.id(),
                app_key = %key.app_key,
                event = %key.event,
                channel = %key.channel,
                "subscription added"
            );
        }
        self.registry.touch(&key, conn.id());
        tracked.state = ConnectionState::Subscribed;

        MessageOutcome::Subscribed(key)
    }

    /// Handle close or error. Removes every subscription the connection held
    /// before returning.
    pub fn on_close(&self, conn: &ConnectionHandle) {
        conn.mark_closed();
        let tracked = self.connections.remove(conn.id());
        let removed = self.registry.remove_all(conn.id());

        if let Some((_, tracked)) = tracked {
            tracing::debug!(
                connection_id = %conn.id(),
                subscriptions = removed,
                connected_for_ms = tracked.connected_at.elapsed().as_millis() as u64,
                "connection closed"
            );
        }
    }

    /// Current state of a connection. Untracked ids report `Closed`.
    pub fn state(&self, conn_id: &str) -> ConnectionState {
        self.connections
            .get(conn_id)
            .map(|tracked| tracked.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ==================== Sweep ====================

    /// Evict every subscription that has been idle longer than the configured
    /// bound or whose connection is no longer open. Works one bucket at a time
    /// and yields between buckets, so a subscribe or publish never waits on
    /// more than one bucket's worth of sweeping. Buckets created after the
    /// sweep enumerated their (appKey, event) pair are left for the next run.
    /// Returns the number of evicted subscriptions.
    pub async fn sweep(&self, now: Instant) -> usize {
        let max_inactive = self.sweep.max_inactive;
        let mut evicted = 0;
        let mut affected: HashSet<ConnectionId> = HashSet::new();

        'sweep: for app_key in self.registry.app_keys() {
            for event in self.registry.events_of(&app_key) {
                for key in self.registry.buckets_of(&app_key, &event) {
                    if self.shutdown_token.is_cancelled() {
                        break 'sweep;
                    }

                    evicted += self.registry.for_each_subscription_at(&key, |key, sub| {
                        let idle = now.saturating_duration_since(sub.last_activity_at());
                        let open = sub.connection().is_open();
                        if idle > max_inactive || !open {
                            tracing::debug!(
                                connection_id = %sub.connection().id(),
                                subscription = %key,
                                idle_ms = idle.as_millis() as u64,
                                age_ms = now.saturating_duration_since(sub.created_at()).as_millis() as u64,
                                open,
                                "evicting subscription"
                            );
                            affected.insert(sub.connection().id().to_string());
                            Visit::Evict
                        } else {
                            Visit::Keep
                        }
                    });

                    tokio::task::yield_now().await;
                }
            }
        }

        // Connections left without tuples drop back to `Connected`.
        for conn_id in affected {
            if let Some(mut tracked) = self.connections.get_mut(&conn_id) {
                if tracked.handle.is_open() && self.registry.subscriptions_of(&conn_id).is_empty() {
                    tracked.state = ConnectionState::Connected;
                }
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, "sweep evicted subscriptions");
        }
        evicted
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = time::interval(self.sweep.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // First tick fires immediately; skip it.

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("sweep task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }
        }
    }

    // ==================== Shutdown ====================

    /// Stop the sweep, refuse new connections and ask every live connection to
    /// close. An in-flight sweep finishes its current bucket first.
    pub async fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_token.cancel();

        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(?err, "sweep task ended abnormally");
            }
        }

        let handles: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in &handles {
            handle.close(CLOSE_NORMAL, SHUTDOWN_REASON);
        }

        tracing::info!(connections = handles.len(), "lifecycle manager shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }
}
