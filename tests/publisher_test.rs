use anyhow::Result;
use async_trait::async_trait;
use leaderboard_pipeline::broker::{BrokerError, MemoryTopic, TopicWriter};
use leaderboard_pipeline::event::{EventEnvelope, GameSession, ScoreSubmission};
use leaderboard_pipeline::publisher::{AsyncPublisher, DeliveryLoop, PublisherSnapshot, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Fails the first `failures` writes, then accepts.
struct FlakyWriter {
    failures: u32,
    calls: AtomicU32,
    accepted: Arc<MemoryTopic>,
}

impl FlakyWriter {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            accepted: MemoryTopic::new("accepted"),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicWriter for FlakyWriter {
    async fn write_message(&self, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(BrokerError::Unavailable("leader not available".into()));
        }
        self.accepted.append(key, value);
        Ok(())
    }
}

/// Never answers.
struct StuckWriter {
    calls: AtomicU32,
}

#[async_trait]
impl TopicWriter for StuckWriter {
    async fn write_message(&self, _key: &[u8], _value: &[u8]) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_millis(10),
    }
}

fn envelope(user: u64, score: i64) -> EventEnvelope {
    let session = GameSession::admit(user.to_string(), ScoreSubmission::new(score, "classic"))
        .expect("valid submission");
    EventEnvelope::score_recorded(session)
}

async fn wait_for(publisher: &AsyncPublisher, done: impl Fn(&PublisherSnapshot) -> bool) -> PublisherSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = publisher.stats();
        if done(&stats) || Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn exhausted_retries_count_one_error_and_drop() -> Result<()> {
    let writer = FlakyWriter::new(u32::MAX);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(10);
    let handle = tokio::spawn(
        DeliveryLoop::new(queue, writer.clone(), fast_policy()).run(shutdown_tx.subscribe()),
    );

    assert!(publisher.enqueue(&envelope(1, 10)));
    let stats = wait_for(&publisher, |s| s.delivery_errors == 1).await;
    assert_eq!(stats.delivery_errors, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.retries, 2);
    assert_eq!(writer.calls(), 3);

    // Dropped, not requeued
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(writer.calls(), 3);
    assert_eq!(publisher.stats().delivery_errors, 1);

    shutdown_tx.send(())?;
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried_until_delivered() -> Result<()> {
    let writer = FlakyWriter::new(2);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(10);
    let handle = tokio::spawn(
        DeliveryLoop::new(queue, writer.clone(), fast_policy()).run(shutdown_tx.subscribe()),
    );

    assert!(publisher.enqueue(&envelope(7, 99)));
    let stats = wait_for(&publisher, |s| s.delivered == 1).await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.delivery_errors, 0);
    assert_eq!(writer.calls(), 3);
    assert_eq!(writer.accepted.keys(), vec![b"7".to_vec()]);

    shutdown_tx.send(())?;
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn each_attempt_is_bounded_by_its_timeout() -> Result<()> {
    let writer = Arc::new(StuckWriter {
        calls: AtomicU32::new(0),
    });
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(10);
    let handle = tokio::spawn(
        DeliveryLoop::new(queue, writer.clone(), fast_policy()).run(shutdown_tx.subscribe()),
    );

    assert!(publisher.enqueue(&envelope(1, 1)));
    let stats = wait_for(&publisher, |s| s.delivery_errors == 1).await;
    assert_eq!(stats.delivery_errors, 1);
    assert_eq!(writer.calls.load(Ordering::SeqCst), 3);

    shutdown_tx.send(())?;
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn delivery_preserves_enqueue_order() -> Result<()> {
    let topic = MemoryTopic::new("scores");
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(100);

    let sent: Vec<EventEnvelope> = (0..20).map(|i| envelope(i % 3, i as i64)).collect();
    for e in &sent {
        assert!(publisher.enqueue(e));
    }
    let handle = tokio::spawn(
        DeliveryLoop::new(queue, topic.clone(), fast_policy()).run(shutdown_tx.subscribe()),
    );

    let stats = wait_for(&publisher, |s| s.delivered == 20).await;
    assert_eq!(stats.delivered, 20);
    let received: Vec<EventEnvelope> = topic
        .values()
        .iter()
        .map(|v| EventEnvelope::from_json(v))
        .collect::<Result<_, _>>()?;
    assert_eq!(received, sent);

    shutdown_tx.send(())?;
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn enqueue_on_full_queue_returns_immediately() -> Result<()> {
    let writer = Arc::new(StuckWriter {
        calls: AtomicU32::new(0),
    });
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(2);
    let policy = RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(60),
        backoff_base: Duration::from_secs(1),
    };
    let handle = tokio::spawn(DeliveryLoop::new(queue, writer, policy).run(shutdown_tx.subscribe()));

    let started = Instant::now();
    let results: Vec<bool> = (0..10).map(|i| publisher.enqueue(&envelope(1, i))).collect();
    assert!(started.elapsed() < Duration::from_millis(500));

    // At most the queue plus the one message held by the stuck delivery
    let queued = results.iter().filter(|q| **q).count() as u64;
    assert!(queued <= 3, "queued {queued}");
    let stats = publisher.stats();
    assert_eq!(stats.enqueued, queued);
    assert_eq!(stats.dropped, 10 - queued);

    shutdown_tx.send(())?;
    tokio::time::timeout(Duration::from_secs(1), handle).await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_interrupts_backoff() -> Result<()> {
    let writer = FlakyWriter::new(u32::MAX);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(10);
    let policy = RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_secs(30),
    };
    let handle = tokio::spawn(
        DeliveryLoop::new(queue, writer.clone(), policy).run(shutdown_tx.subscribe()),
    );

    assert!(publisher.enqueue(&envelope(1, 1)));
    assert!(publisher.enqueue(&envelope(2, 2)));
    let deadline = Instant::now() + Duration::from_secs(5);
    while writer.calls() < 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(writer.calls(), 1);

    shutdown_tx.send(())?;
    tokio::time::timeout(Duration::from_secs(1), handle).await??;

    // The second envelope was abandoned, not drained
    assert_eq!(writer.calls(), 1);
    let stats = publisher.stats();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.delivery_errors, 0);
    Ok(())
}
