use async_trait::async_trait;
use pollcast_kv::{KvStore, MemoryKv};
use pollcast_models::VoteEvent;
use pollcast_mq::{HandlerError, QueueConfig, SendOutcome, VoteHandler, VoteQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_config() -> QueueConfig {
    QueueConfig {
        retry_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        timeout_scan_interval: Duration::from_millis(20),
        ..QueueConfig::default()
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<VoteEvent>>,
}

#[async_trait]
impl VoteHandler for Recorder {
    async fn handle(&self, event: &VoteEvent) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fails the first `failures` attempts of every message.
struct Flaky {
    failures: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl VoteHandler for Flaky {
    async fn handle(&self, event: &VoteEvent) -> Result<(), HandlerError> {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(event.message_id.clone()).or_insert(0);
        *count += 1;
        if *count <= self.failures {
            Err(HandlerError::Retryable("database busy".into()))
        } else {
            Ok(())
        }
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn delivers_in_fifo_order_and_acknowledges() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), QueueConfig {
        max_in_flight: 1,
        ..fast_config()
    });
    for option in 1..=5 {
        queue.send(1, option, None).await.unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    queue.start(recorder.clone()).await.unwrap();
    wait_for(|| recorder.seen.lock().unwrap().len() == 5).await;
    queue.stop().await;

    let options: Vec<i64> = recorder.seen.lock().unwrap().iter().map(|e| e.option_id).collect();
    assert_eq!(options, vec![1, 2, 3, 4, 5]);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.main, stats.in_flight, stats.dead_letter), (0, 0, 0));
}

#[tokio::test]
async fn duplicate_message_ids_are_enqueued_once() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());

    let first = queue.send(3, 9, Some("client-1".into())).await.unwrap();
    let second = queue.send(3, 9, Some("client-1".into())).await.unwrap();
    assert_eq!(first, SendOutcome::Enqueued("client-1".into()));
    assert_eq!(second, SendOutcome::Duplicate("client-1".into()));
    assert_eq!(queue.stats().await.unwrap().main, 1);
}

#[tokio::test]
async fn send_fails_closed_when_store_is_down() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());
    kv.set_available(false);
    assert!(queue.send(1, 1, Some("m".into())).await.is_err());

    kv.set_available(true);
    // The failed attempt must not poison the id.
    let outcome = queue.send(1, 1, Some("m".into())).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Enqueued(_)));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());
    queue.send(1, 2, Some("retry-me".into())).await.unwrap();

    let handler = Arc::new(Flaky {
        failures: 2,
        attempts: Mutex::new(HashMap::new()),
    });
    queue.start(handler.clone()).await.unwrap();
    wait_for(|| handler.attempts.lock().unwrap().get("retry-me") == Some(&3)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    queue.stop().await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.dead_letter, 0);
    assert_eq!(stats.in_flight + stats.main + stats.delayed, 0);
}

#[tokio::test]
async fn exhausted_messages_are_dead_lettered_and_can_be_replayed() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());
    queue.send(1, 2, Some("doomed".into())).await.unwrap();

    let handler = Arc::new(Flaky {
        failures: u32::MAX,
        attempts: Mutex::new(HashMap::new()),
    });
    queue.start(handler.clone()).await.unwrap();
    wait_for(|| handler.attempts.lock().unwrap().get("doomed") == Some(&3)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    queue.stop().await;

    // Exactly max_retries attempts, then parked in the dead-letter list.
    assert_eq!(handler.attempts.lock().unwrap()["doomed"], 3);
    assert_eq!(queue.stats().await.unwrap().dead_letter, 1);

    assert_eq!(queue.retry_dead_letters().await.unwrap(), 1);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.main, stats.dead_letter), (1, 0));
    assert!(kv.hget("vote_retries", "doomed").await.unwrap().is_none());
}

#[tokio::test]
async fn fatal_errors_skip_the_retry_budget() {
    struct Fatal(AtomicU32);

    #[async_trait]
    impl VoteHandler for Fatal {
        async fn handle(&self, _event: &VoteEvent) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Fatal("option vanished".into()))
        }
    }

    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());
    queue.send(4, 4, None).await.unwrap();

    let handler = Arc::new(Fatal(AtomicU32::new(0)));
    queue.start(handler.clone()).await.unwrap();
    wait_for(|| handler.0.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    queue.stop().await;

    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
}

#[tokio::test]
async fn already_processed_ids_are_not_applied_twice() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());

    // Simulates redelivery of a message whose first delivery succeeded but
    // whose acknowledgement was lost.
    kv.sadd("vote_processed", "applied").await.unwrap();
    let payload = VoteEvent::new(1, 1, "applied").to_payload().unwrap();
    kv.lpush("vote_queue", &payload).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    queue.start(recorder.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    queue.stop().await;

    assert!(recorder.seen.lock().unwrap().is_empty());
    assert_eq!(queue.stats().await.unwrap().in_flight, 0);
}

#[tokio::test]
async fn stale_claims_are_returned_by_the_timeout_scan() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), QueueConfig {
        processing_timeout: Duration::from_millis(50),
        ..fast_config()
    });

    let payload = VoteEvent::new(2, 5, "stuck").to_payload().unwrap();
    kv.lpush("vote_processing", &payload).await.unwrap();
    let claimed = chrono::Utc::now().timestamp_millis() - 1_000;
    kv.hset("vote_claimed_at", &payload, &claimed.to_string()).await.unwrap();

    assert_eq!(queue.requeue_timed_out().await.unwrap(), 1);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.in_flight, stats.delayed), (0, 1));
    assert_eq!(kv.hget("vote_retries", "stuck").await.unwrap().as_deref(), Some("1"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(queue.stats().await.unwrap().main, 1);
}

#[tokio::test]
async fn delayed_messages_survive_a_restart() {
    let kv = Arc::new(MemoryKv::new());
    let payload = VoteEvent::new(7, 1, "parked").to_payload().unwrap();
    kv.lpush("vote_delayed", &payload).await.unwrap();

    let queue = VoteQueue::new(kv.clone(), fast_config());
    let recorder = Arc::new(Recorder::default());
    queue.start(recorder.clone()).await.unwrap();
    wait_for(|| recorder.seen.lock().unwrap().len() == 1).await;
    queue.stop().await;

    assert_eq!(recorder.seen.lock().unwrap()[0].message_id, "parked");
}

#[tokio::test]
async fn waiting_messages_can_be_withdrawn() {
    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), fast_config());
    queue.send(5, 1, Some("ballot:1".into())).await.unwrap();
    queue.send(5, 2, Some("ballot:2".into())).await.unwrap();

    assert!(queue.withdraw("ballot:1").await.unwrap());
    assert!(!queue.withdraw("ballot:1").await.unwrap());
    assert!(!queue.withdraw("never-sent").await.unwrap());

    let remaining = kv.lrange("vote_queue").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(VoteEvent::from_payload(&remaining[0]).unwrap().message_id, "ballot:2");
    assert!(!kv.sismember("vote_message_ids", "ballot:1").await.unwrap());

    // The id is free again, so a retry enqueues instead of deduplicating.
    let again = queue.send(5, 1, Some("ballot:1".into())).await.unwrap();
    assert_eq!(again, SendOutcome::Enqueued("ballot:1".into()));
}

#[tokio::test]
async fn lost_acknowledgement_is_recovered_by_the_timeout_scan() {
    /// Takes the store down right after the first delivery so its
    /// acknowledgement cannot be written.
    struct Outage {
        kv: Arc<MemoryKv>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VoteHandler for Outage {
        async fn handle(&self, _event: &VoteEvent) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.kv.set_available(false);
                let kv = self.kv.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    kv.set_available(true);
                });
            }
            Ok(())
        }
    }

    let kv = Arc::new(MemoryKv::new());
    let queue = VoteQueue::new(kv.clone(), QueueConfig {
        processing_timeout: Duration::from_millis(40),
        ..fast_config()
    });
    queue.send(6, 1, Some("unacked".into())).await.unwrap();

    let handler = Arc::new(Outage {
        kv: kv.clone(),
        calls: AtomicU32::new(0),
    });
    queue.start(handler.clone()).await.unwrap();
    wait_for(|| handler.calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    queue.stop().await;

    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.main, stats.in_flight, stats.dead_letter), (0, 0, 0));
    assert!(kv.hget("vote_retries", "unacked").await.unwrap().is_none());
    assert!(kv.sismember("vote_processed", "unacked").await.unwrap());
}
