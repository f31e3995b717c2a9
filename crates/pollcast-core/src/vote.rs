use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::polls::PollService;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use pollcast_kv::SharedKv;
use pollcast_models::{PollKind, ResultSnapshot};
use pollcast_mq::{SendOutcome, VoteQueue};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct VoteConfig {
    pub per_client_per_second: u32,
    pub burst: u32,
    /// Reject a second submission for the same poll from the same submitter.
    pub dedupe_by_submitter: bool,
    pub submitter_lock_ttl: Duration,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            per_client_per_second: 10,
            burst: 20,
            dedupe_by_submitter: true,
            submitter_lock_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoteRequest {
    pub poll_id: i64,
    pub option_ids: Vec<i64>,
    /// Caller-chosen key; repeating it makes the submission a no-op.
    pub idempotency_key: Option<String>,
    /// Submitter identity, usually the client address.
    pub submitter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteAccepted {
    pub poll_id: i64,
    pub message_ids: Vec<String>,
    /// Every message was already known; nothing new was queued.
    pub duplicate: bool,
    pub results: ResultSnapshot,
}

pub fn submitter_guard_key(poll_id: i64, submitter: &str) -> String {
    format!("vote_lock:poll:{poll_id}:voter:{submitter}")
}

#[derive(Clone)]
pub struct VoteService {
    polls: PollService,
    queue: VoteQueue,
    kv: SharedKv,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
    config: VoteConfig,
    metrics: Arc<Metrics>,
}

impl VoteService {
    pub fn new(
        polls: PollService,
        queue: VoteQueue,
        kv: SharedKv,
        config: VoteConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate = NonZeroU32::new(config.per_client_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        Self {
            polls,
            queue,
            kv,
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst))),
            config,
            metrics,
        }
    }

    /// Validate and enqueue a vote. Returns the tallies as they stand now;
    /// the vote itself is applied asynchronously.
    pub async fn submit(&self, request: VoteRequest) -> Result<VoteAccepted, CoreError> {
        let poll_id = request.poll_id;
        if poll_id <= 0 {
            return Err(CoreError::Validation("invalid poll id".into()));
        }

        let mut option_ids: Vec<i64> = Vec::with_capacity(request.option_ids.len());
        for id in request.option_ids {
            if id <= 0 {
                return Err(CoreError::Validation(format!("invalid option id {id}")));
            }
            if !option_ids.contains(&id) {
                option_ids.push(id);
            }
        }
        if option_ids.is_empty() {
            return Err(CoreError::Validation("at least one option is required".into()));
        }

        let idempotency_key = match request.idempotency_key.map(|k| k.trim().to_string()) {
            Some(key) if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN => {
                return Err(CoreError::Validation(format!(
                    "message_id must be 1-{MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
            other => other,
        };

        if let Some(submitter) = request.submitter.as_ref() {
            if self.limiter.check_key(submitter).is_err() {
                tracing::debug!(poll_id, submitter = %submitter, "vote rate limited");
                return Err(CoreError::RateLimited);
            }
        }

        let poll = self.polls.get_poll(poll_id).await?;
        if poll.is_closed() {
            return Err(CoreError::Closed(poll_id));
        }
        if poll.kind == PollKind::SingleChoice && option_ids.len() > 1 {
            return Err(CoreError::Validation(
                "single-choice poll accepts exactly one option".into(),
            ));
        }
        if let Some(&option_id) = option_ids.iter().find(|id| poll.option(**id).is_none()) {
            return Err(CoreError::InvalidOption { poll_id, option_id });
        }

        let guard = match request.submitter.as_deref() {
            Some(submitter) if self.config.dedupe_by_submitter => Some(
                self.claim_submitter(poll_id, submitter, idempotency_key.as_deref())
                    .await?,
            ),
            _ => None,
        };

        let mut message_ids = Vec::with_capacity(option_ids.len());
        let mut enqueued = Vec::new();
        for option_id in &option_ids {
            let message_id = idempotency_key
                .as_ref()
                .map(|key| format!("{key}:{option_id}"));
            match self.queue.send(poll_id, *option_id, message_id).await {
                Ok(outcome) => {
                    if let SendOutcome::Enqueued(id) = &outcome {
                        enqueued.push(id.clone());
                    }
                    message_ids.push(outcome.message_id().to_string());
                }
                Err(err) => {
                    tracing::error!(poll_id, option_id, error = %err, "failed to enqueue vote");
                    let rolled_back = self.withdraw_all(poll_id, &enqueued).await;
                    // The guard stays while any part of the vote is still queued.
                    if rolled_back {
                        if let Some((key, token)) = guard.flatten() {
                            self.release_submitter(&key, &token).await;
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        let fresh = enqueued.len() as u64;
        self.metrics.vote_submitted(fresh);

        let results = match self.polls.current_results(poll_id).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(poll_id, error = %err, "results unavailable after vote, using poll snapshot");
                ResultSnapshot::from_options(poll_id, &poll.options)
            }
        };

        tracing::info!(poll_id, options = option_ids.len(), queued = fresh, "vote accepted");
        Ok(VoteAccepted {
            poll_id,
            message_ids,
            duplicate: fresh == 0,
            results,
        })
    }

    /// Take the per-submitter guard. A retry carrying the same idempotency
    /// key as the original submission passes through. Returns the guard to
    /// release on enqueue failure, or `None` when it was already ours.
    async fn claim_submitter(
        &self,
        poll_id: i64,
        submitter: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Option<(String, String)>, CoreError> {
        let key = submitter_guard_key(poll_id, submitter);
        let token = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self
            .kv
            .set_nx(&key, &token, Some(self.config.submitter_lock_ttl))
            .await?
        {
            return Ok(Some((key, token)));
        }

        let held = self.kv.get(&key).await?;
        match (idempotency_key, held.as_deref()) {
            (Some(mine), Some(held)) if mine == held => Ok(None),
            _ => {
                tracing::debug!(poll_id, submitter, "duplicate submission rejected");
                Err(CoreError::DuplicateSubmission)
            }
        }
    }

    /// Take back the options of a submission that could not be queued in
    /// full. Returns whether nothing of it is left in the queue.
    async fn withdraw_all(&self, poll_id: i64, message_ids: &[String]) -> bool {
        let mut complete = true;
        for message_id in message_ids {
            match self.queue.withdraw(message_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(poll_id, message_id = %message_id, "partial vote already claimed");
                    complete = false;
                }
                Err(err) => {
                    tracing::error!(poll_id, message_id = %message_id, error = %err, "failed to withdraw partial vote");
                    complete = false;
                }
            }
        }
        complete
    }

    async fn release_submitter(&self, key: &str, token: &str) {
        if let Err(err) = self.kv.del_if_eq(key, token).await {
            tracing::warn!(key, error = %err, "failed to release submitter guard");
        }
    }

    /// Forget rate-limiter state for idle submitters.
    pub fn prune_rate_limits(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}
