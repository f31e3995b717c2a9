pub mod error;
pub mod hub;
pub mod metrics;
pub mod polls;
pub mod tally;
pub mod vote;

use chrono::Utc;
use pollcast_cache::{BloomFilter, CacheConfig, CacheStore, LockConfig, LockService};
use pollcast_db::DbPool;
use pollcast_kv::SharedKv;
use pollcast_mq::{QueueConfig, QueueStats, VoteQueue};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use error::CoreError;
pub use hub::{HubConfig, HubError, LiveHub, LivenessPolicy, Subscription};
pub use metrics::{Metrics, MetricsSnapshot};
pub use polls::{CreatePoll, PollService};
pub use tally::{ApplyOutcome, TallyUpdater};
pub use vote::{VoteAccepted, VoteConfig, VoteRequest, VoteService};

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub expected_items: u64,
    pub false_positive_rate: f64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub membership: MembershipConfig,
    pub queue: QueueConfig,
    pub hub: HubConfig,
    pub votes: VoteConfig,
    /// How often expired polls are closed and idle rate-limit state dropped.
    pub sweep_interval: Duration,
    /// Open polls whose results are loaded into the cache at start.
    pub prewarm_limit: i64,
    /// How often the newest open polls get their cached results rewritten.
    pub hot_refresh_interval: Duration,
    /// Polls covered by each hot refresh; zero disables the refresher.
    pub hot_refresh_limit: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            membership: MembershipConfig::default(),
            queue: QueueConfig::default(),
            hub: HubConfig::default(),
            votes: VoteConfig::default(),
            sweep_interval: Duration::from_secs(60),
            prewarm_limit: 100,
            hot_refresh_interval: Duration::from_secs(300),
            hot_refresh_limit: 20,
        }
    }
}

/// The service graph, built once at start-up and handed to every adapter.
#[derive(Clone)]
pub struct Services {
    pub db: DbPool,
    pub kv: SharedKv,
    pub cache: CacheStore,
    pub locks: LockService,
    pub queue: VoteQueue,
    pub hub: LiveHub,
    pub polls: PollService,
    pub votes: VoteService,
    pub tally: TallyUpdater,
    pub metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Services {
    /// Wire the graph without starting any background work.
    pub fn new(db: DbPool, kv: SharedKv, config: ServiceConfig) -> Self {
        let metrics = Arc::new(Metrics::default());
        let locks = LockService::new(kv.clone(), config.lock.clone());
        let bloom = BloomFilter::with_sizing(
            kv.clone(),
            "polls",
            config.membership.expected_items,
            config.membership.false_positive_rate,
        );
        let cache = CacheStore::new(kv.clone(), locks.clone(), bloom, config.cache.clone());
        let queue = VoteQueue::new(kv.clone(), config.queue.clone());
        let hub = LiveHub::new(config.hub.clone(), metrics.clone());
        let polls = PollService::new(db.clone(), cache.clone(), hub.clone());
        let votes = VoteService::new(
            polls.clone(),
            queue.clone(),
            kv.clone(),
            config.votes.clone(),
            metrics.clone(),
        );
        let tally = TallyUpdater::new(db.clone(), cache.clone(), hub.clone(), metrics.clone());

        Self {
            db,
            kv,
            cache,
            locks,
            queue,
            hub,
            polls,
            votes,
            tally,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wire the graph and start the queue consumer, the hub run loop and the
    /// periodic sweeps.
    pub async fn start(
        db: DbPool,
        kv: SharedKv,
        config: ServiceConfig,
    ) -> Result<Self, CoreError> {
        let sweep_interval = config.sweep_interval;
        let prewarm_limit = config.prewarm_limit;
        let hot_refresh = (config.hot_refresh_interval, config.hot_refresh_limit);
        let services = Self::new(db, kv, config);

        if let Err(err) = services.polls.seed_membership().await {
            tracing::warn!(error = %err, "membership filter not seeded");
        }
        services.queue.start(Arc::new(services.tally.clone())).await?;

        let mut tasks = Vec::new();
        if let Some(run_loop) = services.hub.spawn_maintenance(services.shutdown.clone()) {
            tasks.push(run_loop);
        }
        tasks.push(services.spawn_sweeps(sweep_interval));
        if prewarm_limit > 0 {
            let polls = services.polls.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = polls.prewarm(prewarm_limit).await {
                    tracing::warn!(error = %err, "cache prewarm skipped");
                }
            }));
        }
        if hot_refresh.1 > 0 {
            tasks.push(services.spawn_hot_refresh(hot_refresh.0, hot_refresh.1));
        }
        services.lock_tasks().extend(tasks);

        tracing::info!("services started");
        Ok(services)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_sweeps(&self, interval: Duration) -> JoinHandle<()> {
        let polls = self.polls.clone();
        let votes = self.votes.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(err) = polls.close_expired(Utc::now()).await {
                    tracing::warn!(error = %err, "expired poll sweep failed");
                }
                votes.prune_rate_limits();
            }
        })
    }

    fn spawn_hot_refresh(&self, interval: Duration, limit: i64) -> JoinHandle<()> {
        let polls = self.polls.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Prewarm covers the first round.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(err) = polls.refresh_hot(&shutdown, limit).await {
                    tracing::warn!(error = %err, "hot poll refresh failed");
                }
            }
        })
    }

    /// Stop background work, drain the queue consumer and disconnect every
    /// live subscriber.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.stop().await;
        self.hub.close_all();

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "background task ended abnormally");
                }
            }
        }
        tracing::info!("services stopped");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, CoreError> {
        Ok(self.queue.stats().await?)
    }

    pub async fn retry_dead_letters(&self) -> Result<u64, CoreError> {
        Ok(self.queue.retry_dead_letters().await?)
    }

    pub async fn invalidate_patterns(&self, patterns: &[String]) -> Result<u64, CoreError> {
        self.polls.invalidate_patterns(patterns).await
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
