use anyhow::Result;
use async_trait::async_trait;
use leaderboard_pipeline::broker::{BrokerError, TopicWriter};
use leaderboard_pipeline::event::{EventEnvelope, GameSession, ScoreSubmission};
use leaderboard_pipeline::metrics::{self, PublisherMetrics};
use leaderboard_pipeline::publisher::{AsyncPublisher, DeliveryLoop, RetryPolicy};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

// The recorder is process-global, so every test here installs it the same
// way: with the exporter port already taken by another listener.
fn install() -> Result<()> {
    let taken = TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?.to_string();
    metrics::init_metrics(Some(&addr));
    Ok(())
}

/// Value of an unlabelled sample in Prometheus text output.
fn sample(body: &str, name: &str) -> Option<f64> {
    body.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(name) {
            parts.next().and_then(|v| v.parse().ok())
        } else {
            None
        }
    })
}

/// Fails the first write, then accepts.
struct FailsOnce {
    calls: AtomicU32,
}

#[async_trait]
impl TopicWriter for FailsOnce {
    async fn write_message(&self, _key: &[u8], _value: &[u8]) -> Result<(), BrokerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(BrokerError::Unavailable("not enough replicas".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn busy_exporter_port_still_records_in_process() -> Result<()> {
    install()?;
    assert!(metrics::render().is_some(), "recorder handle installed");
    Ok(())
}

#[tokio::test]
async fn dropped_envelopes_appear_in_rendered_output() -> Result<()> {
    install()?;
    PublisherMetrics::record_dropped();
    PublisherMetrics::record_dropped();

    let body = metrics::render().expect("recorder installed");
    assert_eq!(sample(&body, "lb_publisher_dropped_total"), Some(2.0), "{body}");
    Ok(())
}

#[tokio::test]
async fn one_write_duration_observation_per_delivered_envelope() -> Result<()> {
    install()?;
    let writer = Arc::new(FailsOnce {
        calls: AtomicU32::new(0),
    });
    let policy = RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_millis(5),
    };
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, queue) = AsyncPublisher::new(10);
    let handle = tokio::spawn(DeliveryLoop::new(queue, writer.clone(), policy).run(shutdown_tx.subscribe()));

    let session = GameSession::admit("31", ScoreSubmission::new(120, "classic"))?;
    assert!(publisher.enqueue(&EventEnvelope::score_recorded(session)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while publisher.stats().delivered == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(())?;
    handle.await?;

    assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
    let body = metrics::render().expect("recorder installed");
    // Two attempts, one sequence
    assert_eq!(sample(&body, "lb_publisher_write_duration_seconds_count"), Some(1.0), "{body}");
    assert_eq!(sample(&body, "lb_publisher_retries_total"), Some(1.0), "{body}");
    assert_eq!(sample(&body, "lb_publisher_delivered_total"), Some(1.0), "{body}");
    Ok(())
}
