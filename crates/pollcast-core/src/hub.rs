//! In-process fan-out of result snapshots to subscribers of a poll.
//!
//! The registry is a `RwLock`-guarded map of poll id to subscribers. Publish
//! iterates under the read lock and never blocks: each subscriber owns a
//! bounded outbound channel and a subscriber whose channel is full is dropped.
//! Snapshots submitted through [`LiveHub::dispatch`] pass through a bounded
//! channel drained by the hub's run loop, which also runs the cleanup sweeps.

use crate::metrics::Metrics;
use chrono::Utc;
use pollcast_models::{ResultSnapshot, ServerMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("subscriber limit of {0} reached")]
    CapacityReached(usize),
    #[error("hub is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Idle = 3,
    Unregistering = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Active,
            3 => ConnectionState::Idle,
            4 => ConnectionState::Unregistering,
            _ => ConnectionState::Closed,
        }
    }
}

/// Keep-alive cadence for one class of connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub ping_interval: Duration,
    /// A connection with no inbound traffic for this long is abandoned.
    pub read_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub history_per_poll: usize,
    pub history_retention: Duration,
    /// Connections without activity for this long are reported idle.
    pub idle_after: Duration,
    pub inactivity_timeout: Duration,
    pub eviction_interval: Duration,
    pub history_prune_interval: Duration,
    pub dispatch_buffer: usize,
    pub dispatch_retries: u32,
    pub dispatch_backoff: Duration,
    pub standard: LivenessPolicy,
    pub keepalive: LivenessPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            outbound_buffer: 256,
            history_per_poll: 5,
            history_retention: Duration::from_secs(5 * 60),
            idle_after: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(30 * 60),
            eviction_interval: Duration::from_secs(5 * 60),
            history_prune_interval: Duration::from_secs(60),
            dispatch_buffer: 1024,
            dispatch_retries: 2,
            dispatch_backoff: Duration::from_millis(20),
            standard: LivenessPolicy {
                ping_interval: Duration::from_secs(54),
                read_deadline: Duration::from_secs(60),
            },
            keepalive: LivenessPolicy {
                ping_interval: Duration::from_secs(30),
                read_deadline: Duration::from_secs(3 * 60 * 60),
            },
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct ConnectionShared {
    state: AtomicU8,
    last_activity_ms: AtomicI64,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_activity_ms: AtomicI64::new(now_ms()),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_active(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match ConnectionState::from_u8(raw) {
                    ConnectionState::Registered | ConnectionState::Idle => {
                        Some(ConnectionState::Active as u8)
                    }
                    _ => None,
                }
            });
    }

    fn mark_idle(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Active as u8,
            ConnectionState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Release);
        self.mark_active();
    }

    fn idle_for_ms(&self, now: i64) -> i64 {
        now - self.last_activity_ms.load(Ordering::Acquire)
    }
}

struct Subscriber {
    tx: mpsc::Sender<Arc<str>>,
    shared: Arc<ConnectionShared>,
}

struct HistoryEntry {
    at_ms: i64,
    payload: Arc<str>,
}

struct HubInner {
    config: HubConfig,
    registry: RwLock<HashMap<i64, HashMap<u64, Subscriber>>>,
    history: RwLock<HashMap<i64, VecDeque<HistoryEntry>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
    dispatch_tx: mpsc::Sender<ResultSnapshot>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<ResultSnapshot>>>,
}

#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<HubInner>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LiveHub {
    pub fn new(config: HubConfig, metrics: Arc<Metrics>) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_buffer.max(1));
        Self {
            inner: Arc::new(HubInner {
                config,
                registry: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics,
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Register a subscriber for `poll_id`. The most recent broadcast for the
    /// poll, if still retained, is queued to it immediately.
    pub fn subscribe(&self, poll_id: i64, keepalive: bool) -> Result<Subscription, HubError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HubError::ShuttingDown);
        }
        let config = &self.inner.config;
        let (tx, receiver) = mpsc::channel(config.outbound_buffer.max(1));
        let shared = Arc::new(ConnectionShared::new());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = write(&self.inner.registry);
            let total: usize = registry.values().map(HashMap::len).sum();
            if total >= config.max_connections {
                tracing::warn!(poll_id, total, "subscriber limit reached, refusing connection");
                return Err(HubError::CapacityReached(config.max_connections));
            }
            registry.entry(poll_id).or_default().insert(
                id,
                Subscriber {
                    tx: tx.clone(),
                    shared: shared.clone(),
                },
            );
            shared.set_state(ConnectionState::Registered);

            // Sent under the registry lock so a concurrent publish cannot
            // overtake it with an older snapshot.
            if let Some(latest) = self.latest_history(poll_id) {
                let _ = tx.try_send(latest);
            }
        }

        self.inner.metrics.subscriber_opened();
        tracing::debug!(poll_id, subscriber = id, keepalive, "subscriber registered");
        Ok(Subscription {
            id,
            poll_id,
            keepalive,
            receiver,
            shared,
            hub: self.clone(),
        })
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, poll_id: i64, subscriber_id: u64) -> bool {
        let removed = {
            let mut registry = write(&self.inner.registry);
            let removed = registry
                .get_mut(&poll_id)
                .and_then(|subs| subs.remove(&subscriber_id));
            if registry.get(&poll_id).is_some_and(HashMap::is_empty) {
                registry.remove(&poll_id);
            }
            removed
        };

        match removed {
            Some(subscriber) => {
                subscriber.shared.set_state(ConnectionState::Unregistering);
                drop(subscriber.tx);
                subscriber.shared.set_state(ConnectionState::Closed);
                self.inner.metrics.subscribers_closed(1);
                tracing::debug!(poll_id, subscriber = subscriber_id, "subscriber unregistered");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, poll_id: Option<i64>) -> usize {
        let registry = read(&self.inner.registry);
        match poll_id {
            Some(poll_id) => registry.get(&poll_id).map_or(0, HashMap::len),
            None => registry.values().map(HashMap::len).sum(),
        }
    }

    fn latest_history(&self, poll_id: i64) -> Option<Arc<str>> {
        let cutoff = now_ms() - self.inner.config.history_retention.as_millis() as i64;
        read(&self.inner.history)
            .get(&poll_id)
            .and_then(VecDeque::back)
            .filter(|entry| entry.at_ms >= cutoff)
            .map(|entry| entry.payload.clone())
    }

    fn remember(&self, poll_id: i64, payload: Arc<str>) {
        let config = &self.inner.config;
        let now = now_ms();
        let cutoff = now - config.history_retention.as_millis() as i64;
        let mut history = write(&self.inner.history);
        let entries = history.entry(poll_id).or_default();
        entries.push_back(HistoryEntry { at_ms: now, payload });
        while entries.len() > config.history_per_poll.max(1) {
            entries.pop_front();
        }
        while entries.front().is_some_and(|entry| entry.at_ms < cutoff) {
            entries.pop_front();
        }
    }

    pub fn history_len(&self, poll_id: i64) -> usize {
        read(&self.inner.history).get(&poll_id).map_or(0, VecDeque::len)
    }

    /// Serialize once and offer the payload to every subscriber of the poll.
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, snapshot: &ResultSnapshot) -> usize {
        let poll_id = snapshot.poll_id;
        let payload: Arc<str> = match ServerMessage::vote_update(snapshot).to_json() {
            Ok(json) => Arc::from(json),
            Err(err) => {
                tracing::error!(poll_id, error = %err, "failed to serialize vote update");
                return 0;
            }
        };
        self.remember(poll_id, payload.clone());

        let mut delivered = 0;
        let mut slow = Vec::new();
        let mut gone = Vec::new();
        {
            let registry = read(&self.inner.registry);
            if let Some(subscribers) = registry.get(&poll_id) {
                for (id, subscriber) in subscribers {
                    match subscriber.tx.try_send(payload.clone()) {
                        Ok(()) => {
                            subscriber.shared.mark_active();
                            delivered += 1;
                        }
                        Err(TrySendError::Full(_)) => slow.push(*id),
                        Err(TrySendError::Closed(_)) => gone.push(*id),
                    }
                }
            }
        }

        if !slow.is_empty() {
            tracing::warn!(poll_id, count = slow.len(), "dropping slow subscribers");
            self.inner.metrics.slow_consumers_dropped(slow.len() as u64);
        }
        for id in slow.into_iter().chain(gone) {
            self.unsubscribe(poll_id, id);
        }

        self.inner.metrics.broadcast_sent();
        tracing::debug!(poll_id, delivered, "vote update published");
        delivered
    }

    /// Queue a snapshot for the run loop, retrying briefly with growing
    /// backoff while the dispatch channel is saturated.
    pub async fn dispatch(&self, snapshot: ResultSnapshot) -> bool {
        let config = &self.inner.config;
        let poll_id = snapshot.poll_id;
        let mut pending = snapshot;

        for attempt in 0..=config.dispatch_retries {
            match self.inner.dispatch_tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Full(snapshot)) => {
                    pending = snapshot;
                    if attempt < config.dispatch_retries {
                        tokio::time::sleep(config.dispatch_backoff * (attempt + 1)).await;
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!(poll_id, "hub run loop stopped, dropping vote update");
                    self.inner.metrics.dispatch_failed();
                    return false;
                }
            }
        }

        tracing::warn!(poll_id, "hub dispatch saturated, dropping vote update");
        self.inner.metrics.dispatch_failed();
        false
    }

    /// Drop subscribers inactive past the timeout and flag quiet ones idle.
    pub fn evict_inactive(&self) -> usize {
        let config = &self.inner.config;
        let now = now_ms();
        let timeout = config.inactivity_timeout.as_millis() as i64;
        let idle_after = config.idle_after.as_millis() as i64;
        let mut evicted = 0;

        {
            let mut registry = write(&self.inner.registry);
            for subscribers in registry.values_mut() {
                subscribers.retain(|_, subscriber| {
                    let idle_for = subscriber.shared.idle_for_ms(now);
                    if idle_for > timeout {
                        subscriber.shared.set_state(ConnectionState::Closed);
                        evicted += 1;
                        return false;
                    }
                    if idle_for > idle_after {
                        subscriber.shared.mark_idle();
                    }
                    true
                });
            }
            registry.retain(|_, subscribers| !subscribers.is_empty());
        }

        if evicted > 0 {
            self.inner.metrics.subscribers_closed(evicted as u64);
            tracing::info!(evicted, "evicted inactive subscribers");
        }
        evicted
    }

    /// Drop history entries past the retention window.
    pub fn prune_history(&self) -> usize {
        let cutoff = now_ms() - self.inner.config.history_retention.as_millis() as i64;
        let mut pruned = 0;
        let mut history = write(&self.inner.history);
        for entries in history.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.at_ms >= cutoff);
            pruned += before - entries.len();
        }
        history.retain(|_, entries| !entries.is_empty());
        pruned
    }

    /// Start the run loop: drains dispatched snapshots and runs the eviction
    /// and history sweeps. Returns `None` if it is already running.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let receiver = match self.inner.dispatch_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut receiver) = receiver else {
            tracing::warn!("hub run loop already started");
            return None;
        };

        let hub = self.clone();
        Some(tokio::spawn(async move {
            let mut eviction = tokio::time::interval(hub.inner.config.eviction_interval);
            let mut pruning = tokio::time::interval(hub.inner.config.history_prune_interval);
            eviction.tick().await;
            pruning.tick().await;

            loop {
                tokio::select! {
                    next = receiver.recv() => match next {
                        Some(snapshot) => {
                            hub.publish(&snapshot);
                        }
                        None => break,
                    },
                    _ = eviction.tick() => {
                        hub.evict_inactive();
                    }
                    _ = pruning.tick() => {
                        hub.prune_history();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            tracing::info!("hub run loop stopped");
        }))
    }

    /// Refuse new subscribers and disconnect every existing one.
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let closed = {
            let mut registry = write(&self.inner.registry);
            let mut closed = 0;
            for (_, subscribers) in registry.drain() {
                for (_, subscriber) in subscribers {
                    subscriber.shared.set_state(ConnectionState::Closed);
                    closed += 1;
                }
            }
            closed
        };
        self.inner.metrics.subscribers_closed(closed);
        tracing::info!(closed, "hub closed all subscribers");
    }
}

/// Shared handle a transport uses to report inbound traffic.
#[derive(Clone)]
pub struct ActivityHandle(Arc<ConnectionShared>);

impl ActivityHandle {
    pub fn touch(&self) {
        self.0.touch();
    }
}

/// A registered subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    poll_id: i64,
    keepalive: bool,
    receiver: mpsc::Receiver<Arc<str>>,
    shared: Arc<ConnectionShared>,
    hub: LiveHub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn poll_id(&self) -> i64 {
        self.poll_id
    }

    pub fn is_keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn liveness(&self) -> LivenessPolicy {
        let config = &self.hub.inner.config;
        if self.keepalive {
            config.keepalive
        } else {
            config.standard
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn activity(&self) -> ActivityHandle {
        ActivityHandle(self.shared.clone())
    }

    pub fn touch(&self) {
        self.shared.touch();
    }

    /// Next serialized server message. `None` once the hub dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.poll_id, self.id);
    }
}
