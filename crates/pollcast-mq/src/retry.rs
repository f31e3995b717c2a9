use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Deferred redelivery of failed messages.
///
/// A failed message waits in the delayed list while its task sleeps; when the
/// delay elapses the task moves it back onto the main queue. Scheduling the
/// same message again replaces the pending task.
pub struct RetryScheduler {
    pending: Arc<DashMap<String, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
    delay: Duration,
}

impl RetryScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            delay,
        }
    }

    pub fn schedule<F>(&self, message_id: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel(message_id);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let delay = self.delay;
        let key = message_id.to_string();
        let handle = tokio::spawn({
            let key = key.clone();
            async move {
                tokio::time::sleep(delay).await;
                task.await;
                release(&pending, &key, generation);
            }
        });
        self.pending.insert(key.clone(), (generation, handle));
        // A task that finished before its handle was stored could not remove it.
        self.pending
            .remove_if(&key, |_, (owner, handle)| *owner == generation && handle.is_finished());
    }

    pub fn cancel(&self, message_id: &str) {
        if let Some((_, (_, handle))) = self.pending.remove(message_id) {
            handle.abort();
        }
    }

    /// Abort every pending redelivery. Messages stay in the delayed list and
    /// are recovered on the next start.
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|e| !e.value().1.is_finished()).count()
    }
}

/// Drop the entry for `key` only if it still belongs to `generation`; a
/// newer schedule of the same message keeps its slot.
fn release(pending: &DashMap<String, (u64, JoinHandle<()>)>, key: &str, generation: u64) {
    pending.remove_if(key, |_, (owner, _)| *owner == generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn rescheduling_replaces_the_pending_task() {
        let scheduler = RetryScheduler::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            scheduler.schedule("m-1", async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn redelivery_that_reschedules_itself_stays_tracked() {
        let scheduler = Arc::new(RetryScheduler::new(Duration::from_millis(40)));
        let runs = Arc::new(AtomicU32::new(0));

        let again = {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        };
        let first = {
            let scheduler = scheduler.clone();
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                scheduler.schedule("m-1", again);
            }
        };
        scheduler.schedule("m-1", first);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.pending(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1, "the second redelivery lost its slot");

        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_generation_does_not_release_a_newer_task() {
        let scheduler = RetryScheduler::new(Duration::from_secs(60));
        scheduler.schedule("m-1", async {});
        let first = scheduler.pending.get("m-1").map(|e| e.value().0).unwrap();
        scheduler.schedule("m-1", async {});

        release(&scheduler.pending, "m-1", first);
        assert_eq!(scheduler.pending(), 1);
        let current = scheduler.pending.get("m-1").map(|e| e.value().0).unwrap();
        release(&scheduler.pending, "m-1", current);
        assert_eq!(scheduler.pending.len(), 0);
        scheduler.cancel_all();
    }

    #[tokio::test]
    async fn immediate_redelivery_leaves_no_entry_behind() {
        let scheduler = RetryScheduler::new(Duration::ZERO);
        scheduler.schedule("m-1", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.pending.len(), 0);
    }

    #[tokio::test]
    async fn cancel_all_prevents_redelivery() {
        let scheduler = RetryScheduler::new(Duration::from_millis(20));
        let runs = Arc::new(AtomicU32::new(0));
        for id in ["a", "b"] {
            let runs = runs.clone();
            scheduler.schedule(id, async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
