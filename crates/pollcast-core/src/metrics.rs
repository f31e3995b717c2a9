use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process counters owned by the service graph.
#[derive(Debug, Default)]
pub struct Metrics {
    active_subscribers: AtomicU64,
    broadcasts: AtomicU64,
    slow_consumers_dropped: AtomicU64,
    dispatch_failures: AtomicU64,
    votes_submitted: AtomicU64,
    votes_applied: AtomicU64,
    votes_discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_subscribers: u64,
    pub broadcasts: u64,
    pub slow_consumers_dropped: u64,
    pub dispatch_failures: u64,
    pub votes_submitted: u64,
    pub votes_applied: u64,
    pub votes_discarded: u64,
}

fn saturating_decrement(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(by))
    });
}

impl Metrics {
    pub fn subscriber_opened(&self) {
        self.active_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribers_closed(&self, count: u64) {
        saturating_decrement(&self.active_subscribers, count);
    }

    pub fn broadcast_sent(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_consumers_dropped(&self, count: u64) {
        self.slow_consumers_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dispatch_failed(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_submitted(&self, count: u64) {
        self.votes_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn vote_applied(&self) {
        self.votes_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_discarded(&self) {
        self.votes_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            slow_consumers_dropped: self.slow_consumers_dropped.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            votes_submitted: self.votes_submitted.load(Ordering::Relaxed),
            votes_applied: self.votes_applied.load(Ordering::Relaxed),
            votes_discarded: self.votes_discarded.load(Ordering::Relaxed),
        }
    }
}
