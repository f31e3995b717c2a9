//! Durable vote ingestion queue over the shared key/value store.
//!
//! Messages move between lists with single atomic store primitives:
//!
//! ```text
//! send ──► main ──claim──► processing ──ack──► (removed)
//!                 ▲              │
//!                 │          failure
//!                 │              ▼
//!                 └─ delay ── delayed          dead_letter (retries exhausted)
//! ```
//!
//! Delivery is at-least-once. Handlers see each message id at most once per
//! success because acknowledged ids are remembered in a processed set.

mod queue;
mod retry;

use async_trait::async_trait;
use pollcast_kv::KvError;
use pollcast_models::VoteEvent;
use std::time::Duration;
use thiserror::Error;

pub use queue::{QueueStats, SendOutcome, VoteQueue};
pub use retry::RetryScheduler;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] KvError),
    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outcome of a single handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Counted against the retry budget and redelivered after a delay.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Sent straight to the dead-letter list.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait VoteHandler: Send + Sync {
    async fn handle(&self, event: &VoteEvent) -> Result<(), HandlerError>;
}

/// Store keys used by one queue instance.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub main: String,
    pub processing: String,
    pub dead_letter: String,
    pub delayed: String,
    pub retries: String,
    pub claimed_at: String,
    pub seen: String,
    pub processed: String,
}

impl QueueKeys {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            main: format!("{prefix}_queue"),
            processing: format!("{prefix}_processing"),
            dead_letter: format!("{prefix}_dead_letter"),
            delayed: format!("{prefix}_delayed"),
            retries: format!("{prefix}_retries"),
            claimed_at: format!("{prefix}_claimed_at"),
            seen: format!("{prefix}_message_ids"),
            processed: format!("{prefix}_processed"),
        }
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::with_prefix("vote")
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub keys: QueueKeys,
    /// Total delivery attempts before a message is dead-lettered.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Claimed messages older than this are treated as failed.
    pub processing_timeout: Duration,
    pub timeout_scan_interval: Duration,
    /// Idle wait when the main list is empty.
    pub poll_interval: Duration,
    pub max_in_flight: usize,
    /// Lifetime of the producer-side and consumer-side id sets.
    pub dedup_ttl: Duration,
    /// How long `stop` waits for in-flight handlers.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keys: QueueKeys::default(),
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(5 * 60),
            timeout_scan_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            max_in_flight: 64,
            dedup_ttl: Duration::from_secs(48 * 60 * 60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
