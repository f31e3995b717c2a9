//! Distributed mutual exclusion over the shared store.
//!
//! A lock is a key holding a random token, written with set-if-absent and a
//! TTL. Release deletes the key only while it still holds our token, so an
//! expired lock taken over by another holder is never removed by us.

use futures_util::FutureExt;
use pollcast_kv::{KvError, SharedKv};
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const CLOCK_DRIFT_FLOOR: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} is held elsewhere")]
    NotAcquired(String),
    #[error("lock store error: {0}")]
    Store(#[from] KvError),
    #[error("locked operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub tries: u32,
    pub retry_delay: Duration,
    pub drift_factor: f64,
    /// Double the retry delay after every failed attempt.
    pub exponential_backoff: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            tries: 5,
            retry_delay: Duration::from_millis(50),
            drift_factor: 0.01,
            exponential_backoff: false,
        }
    }
}

#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
    acquired_at: Instant,
    valid_for: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lock is still inside its drift-adjusted validity window.
    pub fn is_valid(&self) -> bool {
        self.acquired_at.elapsed() < self.valid_for
    }
}

#[derive(Clone)]
pub struct LockService {
    kv: SharedKv,
    config: LockConfig,
}

impl LockService {
    pub fn new(kv: SharedKv, config: LockConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.config.exponential_backoff {
            return self.config.retry_delay;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config.retry_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        self.acquire_with_tries(name, ttl, self.config.tries).await
    }

    async fn acquire_with_tries(
        &self,
        name: &str,
        ttl: Duration,
        tries: u32,
    ) -> Result<LockHandle, LockError> {
        let key = format!("lock:{name}");
        let token = uuid::Uuid::new_v4().to_string();
        let drift = ttl.mul_f64(self.config.drift_factor) + CLOCK_DRIFT_FLOOR;

        for attempt in 0..tries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }

            let started = Instant::now();
            if !self.kv.set_nx(&key, &token, Some(ttl)).await? {
                continue;
            }

            match ttl.checked_sub(started.elapsed() + drift) {
                Some(valid_for) if !valid_for.is_zero() => {
                    return Ok(LockHandle {
                        key,
                        token,
                        acquired_at: started,
                        valid_for,
                    });
                }
                _ => {
                    // Took too long to be useful; give it back and retry.
                    self.kv.del_if_eq(&key, &token).await?;
                }
            }
        }

        Err(LockError::NotAcquired(name.to_string()))
    }

    /// Returns `false` when the lock had already expired or changed hands.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        Ok(self.kv.del_if_eq(&handle.key, &handle.token).await?)
    }

    async fn release_logged(&self, handle: &LockHandle) {
        match self.release(handle).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(lock = %handle.key, "lock expired before release");
            }
            Err(err) => {
                tracing::warn!(lock = %handle.key, error = %err, "failed to release lock");
            }
        }
    }

    /// Run `work` while holding `name`. The lock is released on every exit
    /// path, including a panic inside `work`, which is then resumed.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        work: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(name, ttl).await?;
        let outcome = AssertUnwindSafe(work()).catch_unwind().await;
        self.release_logged(&handle).await;
        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Single-attempt variant. `work` is aborted when `cancel` fires and the
    /// lock is released either way.
    pub async fn try_with_lock<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        ttl: Duration,
        work: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let handle = self.acquire_with_tries(name, ttl, 1).await?;

        let mut task = tokio::spawn(work());
        let outcome = tokio::select! {
            joined = &mut task => Some(joined),
            _ = cancel.cancelled() => {
                task.abort();
                None
            }
        };
        self.release_logged(&handle).await;

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(join_err)) if join_err.is_panic() => resume_unwind(join_err.into_panic()),
            Some(Err(_)) | None => Err(LockError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcast_kv::{KvStore, MemoryKv};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn service(kv: Arc<MemoryKv>) -> LockService {
        LockService::new(
            kv,
            LockConfig {
                tries: 3,
                retry_delay: Duration::from_millis(5),
                ..LockConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn second_acquirer_fails_until_release() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());

        let first = locks.acquire("poll:1", Duration::from_secs(5)).await.unwrap();
        assert!(first.is_valid());
        assert!(matches!(
            locks.acquire("poll:1", Duration::from_secs(5)).await,
            Err(LockError::NotAcquired(_))
        ));

        assert!(locks.release(&first).await.unwrap());
        let second = locks.acquire("poll:1", Duration::from_secs(5)).await.unwrap();
        assert_ne!(first.token(), second.token());
    }

    #[tokio::test]
    async fn release_does_not_remove_a_lock_taken_over_after_expiry() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());

        let stale = locks.acquire("job", Duration::from_millis(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = locks.acquire("job", Duration::from_secs(5)).await.unwrap();

        assert!(!locks.release(&stale).await.unwrap());
        assert_eq!(
            kv.get(fresh.key()).await.unwrap().as_deref(),
            Some(fresh.token())
        );
    }

    #[tokio::test]
    async fn with_lock_serializes_concurrent_work() {
        let kv = Arc::new(MemoryKv::new());
        let locks = LockService::new(
            kv.clone(),
            LockConfig {
                tries: 200,
                retry_delay: Duration::from_millis(2),
                ..LockConfig::default()
            },
        );
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock("counter", Duration::from_secs(5), || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn with_lock_releases_when_work_panics() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());

        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock("boom", Duration::from_secs(5), || async {
                        panic!("work failed");
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert!(kv.get("lock:boom").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_with_lock_aborts_on_cancel_and_releases() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = locks
            .try_with_lock(&cancel, "slow", Duration::from_secs(5), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await;
        assert!(matches!(result, Err(LockError::Cancelled)));
        assert!(kv.get("lock:slow").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_with_lock_makes_a_single_attempt() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());
        let _held = locks.acquire("busy", Duration::from_secs(5)).await.unwrap();

        let result = locks
            .try_with_lock(&CancellationToken::new(), "busy", Duration::from_secs(5), || async { 1 })
            .await;
        assert!(matches!(result, Err(LockError::NotAcquired(_))));
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let kv = Arc::new(MemoryKv::new());
        let locks = service(kv.clone());
        kv.set_available(false);
        assert!(matches!(
            locks.acquire("x", Duration::from_secs(1)).await,
            Err(LockError::Store(KvError::Unavailable))
        ));
    }
}
