use crate::error::CoreError;
use crate::hub::LiveHub;
use chrono::{DateTime, Utc};
use pollcast_cache::{CacheStore, PrewarmReport};
use pollcast_db::polls::{self as db_polls, NewPoll};
use pollcast_db::{DbError, DbPool};
use pollcast_models::{Poll, PollKind, ResultSnapshot};
use tokio_util::sync::CancellationToken;

const MAX_OPTIONS: usize = 20;
const MAX_QUESTION_LEN: usize = 500;
const MAX_OPTION_LEN: usize = 200;
const MAX_PAGE_SIZE: i64 = 100;

pub fn poll_data_key(poll_id: i64) -> String {
    format!("poll:{poll_id}:data")
}

pub fn poll_results_key(poll_id: i64) -> String {
    format!("poll:{poll_id}:results")
}

pub fn poll_options_key(poll_id: i64) -> String {
    format!("poll:{poll_id}:options")
}

/// Every cache key derived from one poll.
pub fn poll_cache_keys(poll_id: i64) -> Vec<String> {
    vec![
        poll_data_key(poll_id),
        poll_results_key(poll_id),
        poll_options_key(poll_id),
    ]
}

#[derive(Debug, Clone)]
pub struct CreatePoll {
    pub question: String,
    pub description: String,
    pub kind: PollKind,
    pub end_time: Option<DateTime<Utc>>,
    pub options: Vec<String>,
}

/// Poll reads through the cache plus poll lifecycle operations.
#[derive(Clone)]
pub struct PollService {
    db: DbPool,
    cache: CacheStore,
    hub: LiveHub,
}

impl PollService {
    pub fn new(db: DbPool, cache: CacheStore, hub: LiveHub) -> Self {
        Self { db, cache, hub }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn get_poll(&self, poll_id: i64) -> Result<Poll, CoreError> {
        let db = self.db.clone();
        let member = poll_id.to_string();
        self.cache
            .get_with_loader(
                &poll_data_key(poll_id),
                Some(&member),
                self.cache.config().default_ttl,
                || async move { Ok::<_, CoreError>(db_polls::get_poll(&db, poll_id).await?) },
            )
            .await?
            .ok_or(CoreError::NotFound(poll_id))
    }

    /// A page of polls, newest first, read straight from the database.
    pub async fn list_polls(&self, limit: i64, offset: i64) -> Result<Vec<Poll>, CoreError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(db_polls::list_polls(&self.db, limit, offset.max(0)).await?)
    }

    /// Membership filter answer only: `false` means the poll certainly does
    /// not exist, `true` that it may.
    pub async fn may_exist(&self, poll_id: i64) -> bool {
        self.cache.bloom().may_contain(&poll_id.to_string()).await
    }

    /// Current tallies with server-side percentages.
    pub async fn current_results(&self, poll_id: i64) -> Result<ResultSnapshot, CoreError> {
        let member = poll_id.to_string();
        self.cache
            .get_with_loader(
                &poll_results_key(poll_id),
                Some(&member),
                self.cache.config().default_ttl,
                || self.load_results(poll_id),
            )
            .await?
            .ok_or(CoreError::NotFound(poll_id))
    }

    async fn load_results(&self, poll_id: i64) -> Result<Option<ResultSnapshot>, CoreError> {
        let Some(poll) = db_polls::get_poll(&self.db, poll_id).await? else {
            return Ok(None);
        };
        Ok(Some(ResultSnapshot::from_options(poll_id, &poll.options)))
    }

    pub async fn create_poll(&self, request: CreatePoll) -> Result<Poll, CoreError> {
        let question = request.question.trim().to_string();
        if question.is_empty() || question.len() > MAX_QUESTION_LEN {
            return Err(CoreError::Validation(format!(
                "question must be 1-{MAX_QUESTION_LEN} characters"
            )));
        }
        let options: Vec<String> = request
            .options
            .iter()
            .map(|text| text.trim().to_string())
            .collect();
        if options.len() < 2 || options.len() > MAX_OPTIONS {
            return Err(CoreError::Validation(format!(
                "a poll needs between 2 and {MAX_OPTIONS} options"
            )));
        }
        if options
            .iter()
            .any(|text| text.is_empty() || text.len() > MAX_OPTION_LEN)
        {
            return Err(CoreError::Validation(format!(
                "option text must be 1-{MAX_OPTION_LEN} characters"
            )));
        }
        if request.end_time.is_some_and(|end| end <= Utc::now()) {
            return Err(CoreError::Validation("end time must be in the future".into()));
        }

        let poll = db_polls::create_poll(
            &self.db,
            &NewPoll {
                question,
                description: request.description.trim().to_string(),
                kind: request.kind,
                end_time: request.end_time,
                options,
            },
        )
        .await?;

        if let Err(err) = self.cache.bloom().add(&poll.id.to_string()).await {
            tracing::warn!(poll_id = poll.id, error = %err, "failed to register poll in membership filter");
        }
        // A lookup before creation may have cached a negative entry.
        if let Err(err) = self.cache.invalidate(&poll_cache_keys(poll.id)).await {
            tracing::warn!(poll_id = poll.id, error = %err, "failed to clear cache for new poll");
        }
        tracing::info!(poll_id = poll.id, options = poll.options.len(), "poll created");
        Ok(poll)
    }

    /// Administrative reset of every option count to zero.
    pub async fn reset_votes(&self, poll_id: i64) -> Result<ResultSnapshot, CoreError> {
        let options = self
            .cache
            .invalidate_around(
                poll_cache_keys(poll_id),
                db_polls::reset_poll_votes(&self.db, poll_id),
            )
            .await
            .map_err(|err| match err {
                DbError::NotFound => CoreError::NotFound(poll_id),
                other => CoreError::Database(other),
            })?;

        let snapshot = ResultSnapshot::from_options(poll_id, &options);
        self.hub.dispatch(snapshot.clone()).await;
        tracing::info!(poll_id, "poll votes reset");
        Ok(snapshot)
    }

    /// Deactivate polls past their end time and drop their cached state.
    pub async fn close_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>, CoreError> {
        let closed = db_polls::close_expired_polls(&self.db, now).await?;
        for poll_id in &closed {
            if let Err(err) = self.cache.invalidate(&poll_cache_keys(*poll_id)).await {
                tracing::warn!(poll_id, error = %err, "failed to invalidate closed poll");
            }
        }
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "closed expired polls");
        }
        Ok(closed)
    }

    /// Add every stored poll id to the membership filter.
    pub async fn seed_membership(&self) -> Result<usize, CoreError> {
        let ids = db_polls::list_poll_ids(&self.db).await?;
        for id in &ids {
            self.cache.bloom().add(&id.to_string()).await?;
        }
        tracing::info!(count = ids.len(), "membership filter seeded");
        Ok(ids.len())
    }

    /// Load results of the most recent open polls into the cache.
    pub async fn prewarm(&self, limit: i64) -> Result<PrewarmReport, CoreError> {
        let ids = db_polls::list_open_poll_ids(&self.db, Utc::now(), limit).await?;
        let keys = ids.iter().map(|id| poll_results_key(*id)).collect();
        let report = self
            .cache
            .prewarm(keys, |key| {
                let poll_id = key
                    .split(':')
                    .nth(1)
                    .and_then(|raw| raw.parse::<i64>().ok());
                async move {
                    match poll_id {
                        Some(poll_id) => self.load_results(poll_id).await,
                        None => Err(CoreError::Internal(format!("unparseable cache key {key}"))),
                    }
                }
            })
            .await;
        Ok(report)
    }

    /// Rewrite the cached results of the most recent open polls from the
    /// database. Polls another instance is already refreshing are skipped.
    pub async fn refresh_hot(
        &self,
        cancel: &CancellationToken,
        limit: i64,
    ) -> Result<usize, CoreError> {
        let ids = db_polls::list_open_poll_ids(&self.db, Utc::now(), limit).await?;
        let ttl = self.cache.config().default_ttl;
        let mut refreshed = 0;
        for poll_id in ids {
            if cancel.is_cancelled() {
                break;
            }
            let db = self.db.clone();
            let load = async move {
                let poll = db_polls::get_poll(&db, poll_id).await?;
                Ok::<_, CoreError>(
                    poll.map(|poll| ResultSnapshot::from_options(poll_id, &poll.options)),
                )
            };
            match self
                .cache
                .refresh(cancel, &poll_results_key(poll_id), ttl, load)
                .await
            {
                Ok(true) => refreshed += 1,
                Ok(false) => tracing::debug!(poll_id, "hot poll refresh held elsewhere"),
                Err(err) => tracing::warn!(poll_id, error = %err, "hot poll refresh failed"),
            }
        }
        tracing::debug!(refreshed, "hot polls refreshed");
        Ok(refreshed)
    }

    pub async fn invalidate_patterns(&self, patterns: &[String]) -> Result<u64, CoreError> {
        Ok(self.cache.invalidate_patterns(patterns).await?)
    }
}
