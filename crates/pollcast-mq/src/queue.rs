use crate::retry::RetryScheduler;
use crate::{HandlerError, QueueConfig, QueueError, VoteHandler};
use chrono::Utc;
use pollcast_kv::SharedKv;
use pollcast_models::VoteEvent;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued(String),
    /// The message id was already accepted; nothing was enqueued.
    Duplicate(String),
}

impl SendOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Enqueued(id) | SendOutcome::Duplicate(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub main: u64,
    pub in_flight: u64,
    pub delayed: u64,
    pub dead_letter: u64,
}

#[derive(Clone)]
pub struct VoteQueue {
    inner: Arc<Inner>,
}

struct Inner {
    kv: SharedKv,
    config: QueueConfig,
    retries: RetryScheduler,
    in_flight: Arc<Semaphore>,
    shutdown: Mutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl VoteQueue {
    pub fn new(kv: SharedKv, config: QueueConfig) -> Self {
        let permits = config.max_in_flight.max(1);
        Self {
            inner: Arc::new(Inner {
                kv,
                retries: RetryScheduler::new(config.retry_delay),
                in_flight: Arc::new(Semaphore::new(permits)),
                config,
                shutdown: Mutex::new(CancellationToken::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Enqueue one vote. A repeated `message_id` is accepted silently without
    /// enqueueing again. Fails closed when the store is unavailable.
    pub async fn send(
        &self,
        poll_id: i64,
        option_id: i64,
        message_id: Option<String>,
    ) -> Result<SendOutcome, QueueError> {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        let message_id = message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let payload = VoteEvent::new(poll_id, option_id, message_id.clone()).to_payload()?;

        if !kv.sadd(&keys.seen, &message_id).await? {
            tracing::debug!(message_id = %message_id, "duplicate vote message ignored");
            return Ok(SendOutcome::Duplicate(message_id));
        }
        if let Err(err) = kv.expire(&keys.seen, self.inner.config.dedup_ttl).await {
            tracing::warn!(error = %err, "failed to refresh seen-set expiry");
        }

        if let Err(err) = kv.lpush(&keys.main, &payload).await {
            // Forget the id so a client retry is not swallowed as a duplicate.
            if let Err(undo) = kv.srem(&keys.seen, &message_id).await {
                tracing::warn!(message_id = %message_id, error = %undo, "failed to forget message id");
            }
            return Err(err.into());
        }

        tracing::debug!(poll_id, option_id, message_id = %message_id, "vote enqueued");
        Ok(SendOutcome::Enqueued(message_id))
    }

    /// Take back a message that is still waiting in the main list and forget
    /// its id. Returns `false` once a consumer has claimed it.
    pub async fn withdraw(&self, message_id: &str) -> Result<bool, QueueError> {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        let payload = kv.lrange(&keys.main).await?.into_iter().find(|payload| {
            VoteEvent::from_payload(payload).is_ok_and(|event| event.message_id == message_id)
        });
        let Some(payload) = payload else {
            return Ok(false);
        };
        if !kv.lrem(&keys.main, &payload).await? {
            return Ok(false);
        }
        kv.srem(&keys.seen, message_id).await?;
        tracing::debug!(message_id, "queued vote withdrawn");
        Ok(true)
    }

    /// Recover delayed messages and start the consumer and timeout scanner.
    pub async fn start(&self, handler: Arc<dyn VoteHandler>) -> Result<(), QueueError> {
        if !lock(&self.inner.workers).is_empty() {
            tracing::warn!("vote queue already started");
            return Ok(());
        }

        let recovered = self.recover_delayed().await?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued delayed votes from a previous run");
        }

        let token = {
            let mut shutdown = lock(&self.inner.shutdown);
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
            shutdown.clone()
        };

        let consumer = tokio::spawn(self.clone().consume(handler, token.clone()));
        let scanner = tokio::spawn(self.clone().scan_timeouts(token));
        lock(&self.inner.workers).extend([consumer, scanner]);
        tracing::info!(
            max_retries = self.inner.config.max_retries,
            max_in_flight = self.inner.config.max_in_flight,
            "vote queue consumer started"
        );
        Ok(())
    }

    /// Stop consuming, cancel pending redeliveries and wait briefly for
    /// in-flight handlers.
    pub async fn stop(&self) {
        lock(&self.inner.shutdown).cancel();
        self.inner.retries.cancel_all();

        let workers: Vec<_> = lock(&self.inner.workers).drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "vote queue worker ended abnormally");
            }
        }

        let permits = self.inner.config.max_in_flight.max(1) as u32;
        match tokio::time::timeout(
            self.inner.config.shutdown_grace,
            self.inner.in_flight.acquire_many(permits),
        )
        .await
        {
            Ok(Ok(drained)) => drop(drained),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!("vote handlers still running at shutdown"),
        }
        tracing::info!("vote queue consumer stopped");
    }

    async fn recover_delayed(&self) -> Result<u64, QueueError> {
        let keys = &self.inner.config.keys;
        let mut moved = 0;
        while self
            .inner
            .kv
            .rpoplpush(&keys.delayed, &keys.main)
            .await?
            .is_some()
        {
            moved += 1;
        }
        Ok(moved)
    }

    async fn consume(self, handler: Arc<dyn VoteHandler>, token: CancellationToken) {
        let keys = &self.inner.config.keys;
        loop {
            let permit = tokio::select! {
                permit = self.inner.in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = token.cancelled() => break,
            };

            let idle = match self.inner.kv.rpoplpush(&keys.main, &keys.processing).await {
                Ok(Some(payload)) => {
                    if let Err(err) = self
                        .inner
                        .kv
                        .hset(&keys.claimed_at, &payload, &now_ms().to_string())
                        .await
                    {
                        tracing::warn!(error = %err, "failed to stamp claimed vote");
                    }
                    let queue = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        queue.process(handler.as_ref(), payload).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.inner.config.poll_interval,
                Err(err) => {
                    tracing::warn!(error = %err, "vote queue claim failed");
                    STORE_ERROR_BACKOFF
                }
            };

            drop(permit);
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = token.cancelled() => break,
            }
        }
    }

    async fn process(&self, handler: &dyn VoteHandler, payload: String) {
        let event = match VoteEvent::from_payload(&payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = %err, "undecodable vote payload, dead-lettering");
                self.dead_letter(&payload).await;
                return;
            }
        };
        let keys = &self.inner.config.keys;

        match self.inner.kv.sismember(&keys.processed, &event.message_id).await {
            Ok(true) => {
                tracing::debug!(message_id = %event.message_id, "vote already applied, acknowledging");
                self.ack(&payload, &event.message_id).await;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "processed-set lookup failed, handling anyway");
            }
        }

        match handler.handle(&event).await {
            Ok(()) => self.ack(&payload, &event.message_id).await,
            Err(HandlerError::Fatal(reason)) => {
                tracing::error!(message_id = %event.message_id, reason = %reason, "vote failed permanently");
                self.dead_letter(&payload).await;
            }
            Err(HandlerError::Retryable(reason)) => {
                tracing::warn!(message_id = %event.message_id, reason = %reason, "vote handling failed");
                self.fail(&payload, &event.message_id).await;
            }
        }
    }

    async fn ack(&self, payload: &str, message_id: &str) {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        if let Err(err) = kv.sadd(&keys.processed, message_id).await {
            tracing::warn!(message_id, error = %err, "failed to record processed vote");
        } else if let Err(err) = kv.expire(&keys.processed, self.inner.config.dedup_ttl).await {
            tracing::warn!(error = %err, "failed to refresh processed-set expiry");
        }
        if let Err(err) = kv.lrem(&keys.processing, payload).await {
            tracing::warn!(message_id, error = %err, "failed to acknowledge vote");
        }
        self.forget_claim(payload).await;
        if let Err(err) = kv.hdel(&keys.retries, message_id).await {
            tracing::warn!(message_id, error = %err, "failed to clear vote retry count");
        }
    }

    async fn forget_claim(&self, payload: &str) {
        let keys = &self.inner.config.keys;
        if let Err(err) = self.inner.kv.hdel(&keys.claimed_at, payload).await {
            tracing::warn!(error = %err, "failed to clear vote claim stamp");
        }
    }

    async fn dead_letter(&self, payload: &str) {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        match kv.lmove_value(&keys.processing, &keys.dead_letter, payload).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = kv.lpush(&keys.dead_letter, payload).await {
                    tracing::error!(error = %err, "failed to dead-letter vote");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to dead-letter vote"),
        }
        self.forget_claim(payload).await;
    }

    /// Count a failed attempt, then either dead-letter or park the message in
    /// the delayed list until its redelivery is due.
    async fn fail(&self, payload: &str, message_id: &str) {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;

        let attempts = match kv.hincr(&keys.retries, message_id, 1).await {
            Ok(attempts) => attempts,
            Err(err) => {
                // Leave it in processing; the timeout scan picks it up again.
                tracing::warn!(message_id, error = %err, "failed to count vote retry");
                return;
            }
        };

        if attempts >= i64::from(self.inner.config.max_retries) {
            tracing::error!(message_id, attempts, "vote retries exhausted, dead-lettering");
            self.dead_letter(payload).await;
            return;
        }

        match kv.lmove_value(&keys.processing, &keys.delayed, payload).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(message_id, error = %err, "failed to park vote for retry");
                return;
            }
        }
        self.forget_claim(payload).await;

        let kv = kv.clone();
        let delayed = keys.delayed.clone();
        let main = keys.main.clone();
        let payload = payload.to_string();
        let id = message_id.to_string();
        self.inner.retries.schedule(message_id, async move {
            match kv.lmove_value(&delayed, &main, &payload).await {
                Ok(_) => tracing::debug!(message_id = %id, "vote requeued for retry"),
                Err(err) => {
                    tracing::warn!(message_id = %id, error = %err, "failed to requeue vote")
                }
            }
        });
    }

    async fn scan_timeouts(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.timeout_scan_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => break,
            }
            match self.requeue_timed_out().await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "timed-out votes returned for retry"),
                Err(err) => tracing::warn!(error = %err, "vote timeout scan failed"),
            }
        }
    }

    /// Treat claimed messages older than the processing timeout as failed.
    pub async fn requeue_timed_out(&self) -> Result<u64, QueueError> {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        let timeout_ms = self.inner.config.processing_timeout.as_millis() as i64;
        let now = now_ms();
        let mut expired = 0;

        for payload in kv.lrange(&keys.processing).await? {
            let claimed = kv
                .hget(&keys.claimed_at, &payload)
                .await?
                .and_then(|raw| raw.parse::<i64>().ok());
            let Some(claimed) = claimed else {
                // Claimed by a consumer that died before stamping it.
                kv.hset(&keys.claimed_at, &payload, &now.to_string()).await?;
                continue;
            };
            if now - claimed < timeout_ms {
                continue;
            }

            expired += 1;
            match VoteEvent::from_payload(&payload) {
                Ok(event) => self.fail(&payload, &event.message_id).await,
                Err(_) => self.dead_letter(&payload).await,
            }
        }
        Ok(expired)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        Ok(QueueStats {
            main: kv.llen(&keys.main).await?,
            in_flight: kv.llen(&keys.processing).await?,
            delayed: kv.llen(&keys.delayed).await?,
            dead_letter: kv.llen(&keys.dead_letter).await?,
        })
    }

    /// Move every dead-lettered message back onto the main queue with a fresh
    /// retry budget.
    pub async fn retry_dead_letters(&self) -> Result<u64, QueueError> {
        let keys = &self.inner.config.keys;
        let kv = &self.inner.kv;
        let mut moved = 0;
        while let Some(payload) = kv.rpoplpush(&keys.dead_letter, &keys.main).await? {
            if let Ok(event) = VoteEvent::from_payload(&payload) {
                kv.hdel(&keys.retries, &event.message_id).await?;
            }
            moved += 1;
        }
        if moved > 0 {
            tracing::info!(moved, "dead-lettered votes requeued");
        }
        Ok(moved)
    }
}
