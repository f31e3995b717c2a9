use crate::error::CoreError;
use crate::hub::LiveHub;
use crate::metrics::Metrics;
use crate::polls::poll_cache_keys;
use async_trait::async_trait;
use chrono::Utc;
use pollcast_cache::CacheStore;
use pollcast_db::polls::{self as db_polls, TallyOutcome};
use pollcast_db::DbPool;
use pollcast_models::{ResultSnapshot, VoteEvent};
use pollcast_mq::{HandlerError, VoteHandler};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(ResultSnapshot),
    /// Handled but not counted: the poll closed or the option vanished
    /// after the vote was accepted.
    Discarded(&'static str),
}

/// Applies queued votes to the durable store, then refreshes caches and
/// notifies live subscribers.
#[derive(Clone)]
pub struct TallyUpdater {
    db: DbPool,
    cache: CacheStore,
    hub: LiveHub,
    metrics: Arc<Metrics>,
}

impl TallyUpdater {
    pub fn new(db: DbPool, cache: CacheStore, hub: LiveHub, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            cache,
            hub,
            metrics,
        }
    }

    pub async fn apply(&self, poll_id: i64, option_id: i64) -> Result<ApplyOutcome, CoreError> {
        let outcome = self
            .cache
            .invalidate_around(
                poll_cache_keys(poll_id),
                db_polls::apply_vote(&self.db, poll_id, option_id, Utc::now()),
            )
            .await?;

        let reason = match outcome {
            TallyOutcome::Applied(options) => {
                self.metrics.vote_applied();
                let snapshot = ResultSnapshot::from_options(poll_id, &options);
                self.hub.dispatch(snapshot.clone()).await;
                tracing::debug!(poll_id, option_id, total = snapshot.total_votes, "vote applied");
                return Ok(ApplyOutcome::Applied(snapshot));
            }
            TallyOutcome::PollClosed => "poll closed",
            TallyOutcome::PollMissing => "poll missing",
            TallyOutcome::OptionMissing => "option missing",
        };

        self.metrics.vote_discarded();
        tracing::info!(poll_id, option_id, reason, "vote discarded");
        Ok(ApplyOutcome::Discarded(reason))
    }
}

#[async_trait]
impl VoteHandler for TallyUpdater {
    async fn handle(&self, event: &VoteEvent) -> Result<(), HandlerError> {
        match self.apply(event.poll_id, event.option_id).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => Err(HandlerError::Retryable(err.to_string())),
            Err(err) => Err(HandlerError::Fatal(err.to_string())),
        }
    }
}
