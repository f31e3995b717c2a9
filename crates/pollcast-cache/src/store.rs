use crate::bloom::BloomFilter;
use crate::lock::{LockError, LockService};
use crate::CacheError;
use futures_util::future::join_all;
use pollcast_kv::SharedKv;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REFRESH_LOCK_TTL: Duration = Duration::from_secs(1);

/// Stored in place of a value for keys whose source returned "not found".
pub const NEGATIVE_MARKER: &str = "nil";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    /// TTL of negative entries.
    pub null_ttl: Duration,
    /// Positive TTLs are spread by up to this fraction in either direction.
    pub jitter_fraction: f64,
    pub lock_ttl: Duration,
    pub double_delete_delay: Duration,
    /// Extra random TTL added to pre-warmed keys.
    pub prewarm_spread: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60),
            null_ttl: Duration::from_secs(5 * 60),
            jitter_fraction: 0.1,
            lock_ttl: Duration::from_secs(5),
            double_delete_delay: Duration::from_millis(10),
            prewarm_spread: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Default)]
pub struct PrewarmReport {
    pub warmed: usize,
    pub failures: Vec<(String, String)>,
}

enum Lookup<T> {
    Hit(T),
    Negative,
    Miss,
}

/// Cache-aside reads with stampede, penetration and avalanche protection,
/// plus delayed double-delete invalidation around writes.
#[derive(Clone)]
pub struct CacheStore {
    kv: SharedKv,
    locks: LockService,
    bloom: BloomFilter,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(kv: SharedKv, locks: LockService, bloom: BloomFilter, config: CacheConfig) -> Self {
        Self {
            kv,
            locks,
            bloom,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        let fraction = self.config.jitter_fraction.clamp(0.0, 0.9);
        if fraction == 0.0 {
            return ttl;
        }
        let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
        ttl.mul_f64(factor)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CacheError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(Lookup::Miss);
        };
        if raw == NEGATIVE_MARKER {
            return Ok(Lookup::Negative);
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Lookup::Hit(value)),
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding undecodable cache entry");
                Ok(Lookup::Miss)
            }
        }
    }

    async fn store_value<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache value not serializable");
                return;
            }
        };
        if let Err(err) = self.kv.set(key, &payload, Some(self.jittered(ttl))).await {
            tracing::warn!(key, error = %err, "cache write failed");
        }
    }

    async fn store_negative(&self, key: &str) {
        if let Err(err) = self
            .kv
            .set(key, NEGATIVE_MARKER, Some(self.config.null_ttl))
            .await
        {
            tracing::warn!(key, error = %err, "negative cache write failed");
        }
    }

    /// Read `key`, loading and caching from the source of truth on a miss.
    ///
    /// * `member` is the entity identifier checked against the membership
    ///   filter before the source is consulted; `None` skips the filter.
    /// * Only one caller per key runs `loader` at a time. Callers that give
    ///   up waiting for the lock re-read the cache once and read the source
    ///   themselves if the key is still missing.
    /// * A loader result of `None` is cached as a negative entry.
    /// * When the store itself is unreachable the loader is called directly.
    pub async fn get_with_loader<T, E, F, Fut>(
        &self,
        key: &str,
        member: Option<&str>,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        match self.lookup::<T>(key).await {
            Ok(Lookup::Hit(value)) => return Ok(Some(value)),
            Ok(Lookup::Negative) => return Ok(None),
            Ok(Lookup::Miss) => {}
            Err(err) => {
                tracing::warn!(key, error = %err, "cache unavailable, reading through");
                return loader().await;
            }
        }

        if let Some(member) = member {
            if !self.bloom.may_contain(member).await {
                tracing::debug!(key, member, "membership filter rejected lookup");
                return Ok(None);
            }
        }

        let mut loader = Some(loader);
        let pending = &mut loader;
        let filled = self
            .locks
            .with_lock(&format!("cache:{key}"), self.config.lock_ttl, move || {
                self.fill(key, member, ttl, pending)
            })
            .await;

        match filled {
            Ok(result) => result,
            Err(LockError::NotAcquired(_)) => match self.lookup::<T>(key).await {
                Ok(Lookup::Hit(value)) => Ok(Some(value)),
                Ok(Lookup::Negative) => Ok(None),
                Ok(Lookup::Miss) | Err(_) => {
                    // The holder has not filled the key yet; read the source
                    // ourselves rather than report the entity as missing.
                    tracing::debug!(key, "cache lock contended, reading through");
                    match loader.take() {
                        Some(loader) => {
                            let loaded = loader().await?;
                            if let Some(value) = &loaded {
                                self.store_value(key, value, ttl).await;
                            }
                            Ok(loaded)
                        }
                        None => Ok(None),
                    }
                }
            },
            Err(err) => {
                tracing::warn!(key, error = %err, "cache lock unavailable, reading through");
                match loader.take() {
                    Some(loader) => loader().await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn fill<T, E, F, Fut>(
        &self,
        key: &str,
        member: Option<&str>,
        ttl: Duration,
        loader: &mut Option<F>,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        // Another holder may have filled the key while we waited.
        match self.lookup::<T>(key).await {
            Ok(Lookup::Hit(value)) => return Ok(Some(value)),
            Ok(Lookup::Negative) => return Ok(None),
            Ok(Lookup::Miss) => {}
            Err(err) => tracing::warn!(key, error = %err, "cache re-check failed"),
        }

        let Some(loader) = loader.take() else {
            return Ok(None);
        };
        let loaded = loader().await?;
        match &loaded {
            Some(value) => {
                self.store_value(key, value, ttl).await;
                if let Some(member) = member {
                    if let Err(err) = self.bloom.add(member).await {
                        tracing::warn!(member, error = %err, "membership filter update failed");
                    }
                }
            }
            None => self.store_negative(key).await,
        }
        Ok(loaded)
    }

    /// Reload `key` from the source under a single-attempt refresh lock so
    /// only one instance rewrites a hot key per round. Returns `Ok(false)`
    /// when the refresh lock is held elsewhere or `cancel` fired.
    pub async fn refresh<T, E, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        load: Fut,
    ) -> Result<bool, E>
    where
        T: Serialize + Send + Sync + 'static,
        E: From<CacheError> + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
    {
        let store = self.clone();
        let owned_key = key.to_string();
        let outcome = self
            .locks
            .try_with_lock(cancel, &format!("refresh:{key}"), REFRESH_LOCK_TTL, move || async move {
                match load.await? {
                    Some(value) => store.store_value(&owned_key, &value, ttl).await,
                    None => store.store_negative(&owned_key).await,
                }
                Ok::<_, E>(())
            })
            .await;

        match outcome {
            Ok(result) => result.map(|()| true),
            Err(LockError::NotAcquired(_)) | Err(LockError::Cancelled) => Ok(false),
            Err(LockError::Store(err)) => Err(CacheError::from(err).into()),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        self.store_value(key, value, ttl).await;
    }

    pub async fn invalidate(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.kv.del(keys).await?)
    }

    /// Delete every key matching any of the glob patterns.
    pub async fn invalidate_patterns(&self, patterns: &[String]) -> Result<u64, CacheError> {
        let mut removed = 0;
        for pattern in patterns {
            let keys = self.kv.keys(pattern).await?;
            removed += self.invalidate(&keys).await?;
        }
        Ok(removed)
    }

    /// Delete `keys`, run `write`, then delete `keys` again after a short
    /// delay so a reader that repopulated from pre-write data is evicted.
    pub async fn invalidate_around<Fut, T>(&self, keys: Vec<String>, write: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        if let Err(err) = self.invalidate(&keys).await {
            tracing::warn!(?keys, error = %err, "pre-write invalidation failed");
        }

        let out = write.await;

        let kv = self.kv.clone();
        let delay = self.config.double_delete_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = kv.del(&keys).await {
                tracing::warn!(?keys, error = %err, "delayed invalidation failed");
            }
        });

        out
    }

    /// Load every key up front with a randomized TTL so they do not expire
    /// together.
    pub async fn prewarm<T, E, F, Fut>(&self, keys: Vec<String>, loader: F) -> PrewarmReport
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError> + Display,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let spread_ms = self.config.prewarm_spread.as_millis() as u64;
        let loads = keys.into_iter().map(|key| {
            let extra = if spread_ms == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..spread_ms)
            };
            let ttl = self.config.default_ttl + Duration::from_millis(extra);
            let fut = loader(key.clone());
            async move {
                let result = self.get_with_loader(&key, None, ttl, || fut).await;
                (key, result)
            }
        });

        let mut report = PrewarmReport::default();
        for (key, result) in join_all(loads).await {
            match result {
                Ok(_) => report.warmed += 1,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "cache prewarm failed");
                    report.failures.push((key, err.to_string()));
                }
            }
        }
        tracing::info!(
            warmed = report.warmed,
            failed = report.failures.len(),
            "cache prewarm finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use pollcast_kv::{KvStore, MemoryKv};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Cache(#[from] CacheError),
        #[error("source down")]
        Source,
    }

    fn cache(kv: Arc<MemoryKv>) -> CacheStore {
        let locks = LockService::new(
            kv.clone(),
            LockConfig {
                tries: 100,
                retry_delay: Duration::from_millis(5),
                ..LockConfig::default()
            },
        );
        let bloom = BloomFilter::with_sizing(kv.clone(), "items", 1_000, 0.01);
        CacheStore::new(kv, locks, bloom, CacheConfig::default())
    }

    #[tokio::test]
    async fn concurrent_misses_call_the_loader_once() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        cache.bloom().add("7").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_with_loader::<Item, TestError, _, _>(
                        "item:7",
                        Some("7"),
                        Duration::from_secs(60),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Some(Item { name: "seven".into() }))
                        },
                    )
                    .await
            }));
        }

        for task in tasks {
            let item = task.await.unwrap().unwrap();
            assert_eq!(item.unwrap().name, "seven");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_entities_are_cached_negatively() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        cache.bloom().add("9").await.unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let found = cache
                .get_with_loader::<Item, TestError, _, _>(
                    "item:9",
                    Some("9"),
                    Duration::from_secs(60),
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    },
                )
                .await
                .unwrap();
            assert!(found.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kv.get("item:9").await.unwrap().as_deref(), Some(NEGATIVE_MARKER));
        let ttl = kv.ttl("item:9").unwrap();
        assert!(ttl <= Duration::from_secs(5 * 60));
    }

    #[tokio::test]
    async fn membership_filter_short_circuits_unknown_ids() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());

        let found = cache
            .get_with_loader::<Item, TestError, _, _>(
                "item:404",
                Some("404"),
                Duration::from_secs(60),
                || async { panic!("loader must not run") },
            )
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(kv.get("item:404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn positive_ttl_is_jittered_within_bounds() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());

        cache
            .get_with_loader::<Item, TestError, _, _>("item:1", None, Duration::from_secs(100), || async {
                Ok(Some(Item { name: "one".into() }))
            })
            .await
            .unwrap();
        let ttl = kv.ttl("item:1").unwrap();
        assert!(ttl <= Duration::from_secs(110), "ttl {ttl:?}");
        assert!(ttl >= Duration::from_secs(89), "ttl {ttl:?}");
    }

    #[tokio::test]
    async fn store_outage_reads_through_to_the_loader() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        kv.set_available(false);

        let found = cache
            .get_with_loader::<Item, TestError, _, _>("item:2", Some("2"), Duration::from_secs(60), || async {
                Ok(Some(Item { name: "two".into() }))
            })
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "two");

        let failed = cache
            .get_with_loader::<Item, TestError, _, _>("item:3", None, Duration::from_secs(60), || async {
                Err(TestError::Source)
            })
            .await;
        assert!(matches!(failed, Err(TestError::Source)));
    }

    #[tokio::test]
    async fn contended_rebuild_lock_reads_through_to_the_source() {
        let kv = Arc::new(MemoryKv::new());
        let locks = LockService::new(
            kv.clone(),
            LockConfig {
                tries: 2,
                retry_delay: Duration::from_millis(5),
                ..LockConfig::default()
            },
        );
        let bloom = BloomFilter::with_sizing(kv.clone(), "items", 1_000, 0.01);
        let cache = CacheStore::new(kv.clone(), locks, bloom, CacheConfig::default());
        cache.bloom().add("5").await.unwrap();
        kv.set("lock:cache:item:5", "other-holder", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let found = cache
            .get_with_loader::<Item, TestError, _, _>("item:5", Some("5"), Duration::from_secs(60), || async {
                Ok(Some(Item { name: "five".into() }))
            })
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "five");
        assert!(kv.get("item:5").await.unwrap().is_some());
        assert_eq!(
            kv.get("lock:cache:item:5").await.unwrap().as_deref(),
            Some("other-holder")
        );
    }

    #[tokio::test]
    async fn refresh_rewrites_the_key_unless_another_refresher_holds_it() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        let cancel = CancellationToken::new();
        kv.set("item:hot", r#"{"name":"stale"}"#, None).await.unwrap();

        let refreshed = cache
            .refresh(&cancel, "item:hot", Duration::from_secs(60), async {
                Ok::<_, TestError>(Some(Item { name: "fresh".into() }))
            })
            .await
            .unwrap();
        assert!(refreshed);
        assert_eq!(
            kv.get("item:hot").await.unwrap().as_deref(),
            Some(r#"{"name":"fresh"}"#)
        );
        assert!(kv.get("lock:refresh:item:hot").await.unwrap().is_none());

        kv.set("lock:refresh:item:hot", "other-instance", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let skipped = cache
            .refresh(&cancel, "item:hot", Duration::from_secs(60), async {
                Ok::<_, TestError>(Some(Item { name: "newer".into() }))
            })
            .await
            .unwrap();
        assert!(!skipped);
        assert_eq!(
            kv.get("item:hot").await.unwrap().as_deref(),
            Some(r#"{"name":"fresh"}"#)
        );

        cancel.cancel();
        kv.del(&["lock:refresh:item:hot".to_string()]).await.unwrap();
        let cancelled = cache
            .refresh(&cancel, "item:hot", Duration::from_secs(60), async {
                Ok::<_, TestError>(Some(Item { name: "late".into() }))
            })
            .await
            .unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn double_delete_evicts_stale_repopulation() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        kv.set("poll:1:results", "\"old\"", None).await.unwrap();

        let keys = vec!["poll:1:results".to_string()];
        let writer_kv = kv.clone();
        cache
            .invalidate_around(keys, async move {
                assert!(writer_kv.get("poll:1:results").await.unwrap().is_none());
                // A concurrent reader repopulates with pre-write data.
                writer_kv
                    .set("poll:1:results", "\"stale\"", None)
                    .await
                    .unwrap();
            })
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(kv.get("poll:1:results").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pattern_invalidation_removes_matching_keys() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        for key in ["poll:1:data", "poll:1:results", "poll:2:data"] {
            kv.set(key, "{}", None).await.unwrap();
        }

        let removed = cache
            .invalidate_patterns(&["poll:1:*".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(kv.get("poll:2:data").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prewarm_reports_failures_per_key() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        let keys = vec!["item:a".to_string(), "item:b".to_string()];

        let report = cache
            .prewarm::<Item, TestError, _, _>(keys, |key| async move {
                if key == "item:b" {
                    Err(TestError::Source)
                } else {
                    Ok(Some(Item { name: key }))
                }
            })
            .await;

        assert_eq!(report.warmed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "item:b");
        let ttl = kv.ttl("item:a").unwrap();
        assert!(ttl > Duration::from_secs(50 * 60));
    }
}
