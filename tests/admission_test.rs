use anyhow::Result;
use leaderboard_pipeline::admission::Admission;
use leaderboard_pipeline::broker::MemoryTopic;
use leaderboard_pipeline::config::Config;
use leaderboard_pipeline::error::PipelineError;
use leaderboard_pipeline::event::{timestamp_of, EventEnvelope, ScoreSubmission};
use leaderboard_pipeline::publisher::AsyncPublisher;
use leaderboard_pipeline::rate_limiter::{Limits, RateLimiter};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn limiter(burst: u32) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(Limits {
        tokens_per_minute: 30.0,
        burst,
    }))
}

#[tokio::test]
async fn admitted_score_reaches_the_topic() -> Result<()> {
    let mut config = Config::default();
    config.publisher.backoff_base_ms = 10;
    let topic = MemoryTopic::new("game-sessions");
    let (shutdown_tx, _) = broadcast::channel(1);
    let (publisher, delivery) =
        AsyncPublisher::start(topic.clone(), &config.publisher, shutdown_tx.subscribe());
    let admission = Admission::new(limiter(1), publisher.clone());

    let admitted = admission.submit(1234, ScoreSubmission::new(250, "classic"))?;
    assert!(admitted.queued);
    let session = &admitted.session;
    assert_eq!(session.user_id, "1234");
    assert_eq!(session.score, 250);
    assert_eq!(session.game_mode, "classic");
    assert_eq!(session.session_id.get_version_num(), 7);
    assert_eq!(session.timestamp, timestamp_of(&session.session_id));

    let deadline = Instant::now() + Duration::from_secs(5);
    while topic.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(topic.keys(), vec![b"1234".to_vec()]);
    let envelope = EventEnvelope::from_json(&topic.values()[0])?;
    assert_eq!(envelope.event_type, "game_score_recorded");
    assert_eq!(&envelope.session, session);

    shutdown_tx.send(())?;
    delivery.await?;
    Ok(())
}

#[tokio::test]
async fn out_of_range_or_malformed_submissions_are_rejected() -> Result<()> {
    let (publisher, _queue) = AsyncPublisher::new(10);
    let admission = Admission::new(limiter(10), publisher.clone());

    for (user, submission) in [
        (1, ScoreSubmission::new(501, "classic")),
        (2, ScoreSubmission::new(-1, "classic")),
        (3, ScoreSubmission::new(10, "bad mode")),
        (4, ScoreSubmission::new(10, "")),
        (5, ScoreSubmission::new(10, "classic;drop")),
    ] {
        let err = admission.submit(user, submission).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{err}");
        assert!(!err.is_retryable());
    }
    assert_eq!(publisher.stats().enqueued, 0);

    for submission in [
        ScoreSubmission::new(0, "classic"),
        ScoreSubmission::new(500, "speed_run-2"),
    ] {
        assert!(admission.submit(6, submission).is_ok());
    }
    assert_eq!(publisher.stats().enqueued, 2);
    Ok(())
}

#[test]
fn rapid_requests_admit_exactly_the_burst() {
    let (publisher, _queue) = AsyncPublisher::new(100);
    let admission = Admission::new(limiter(3), publisher);

    let outcomes: Vec<bool> = (0..8)
        .map(|_| admission.submit(77, ScoreSubmission::new(1, "classic")).is_ok())
        .collect();
    assert_eq!(outcomes, vec![true, true, true, false, false, false, false, false]);

    let err = admission
        .submit(77, ScoreSubmission::new(1, "classic"))
        .unwrap_err();
    assert!(err.is_retryable());
    // Another principal is unaffected
    assert!(admission.submit(78, ScoreSubmission::new(1, "classic")).is_ok());
}

#[test]
fn concurrent_first_access_shares_one_bucket() {
    let limiter = limiter(1);
    let barrier = Arc::new(Barrier::new(16));
    let now = Instant::now();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let bucket = limiter.bucket(42, now);
                let allowed = limiter.allow_at(42, now);
                (bucket, allowed)
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked"))
        .collect();

    let first = &results[0].0;
    assert!(results.iter().all(|(b, _)| Arc::ptr_eq(b, first)));
    assert_eq!(results.iter().filter(|(_, allowed)| *allowed).count(), 1);
    assert_eq!(limiter.tracked_principals(), 1);
}
