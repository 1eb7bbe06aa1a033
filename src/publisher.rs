//! Non-blocking publish path from the request handlers to the topic.
//!
//! ```text
//! request handlers               background
//! ────────────────               ──────────
//!   enqueue() ── try_send ──▶ [bounded queue] ──▶ DeliveryLoop ──▶ TopicWriter
//!        │                                          retry × N, timeout per attempt
//!        └─ full: drop + count                      exhausted: drop + count
//! ```
//!
//! `enqueue` never waits. A full queue sheds the envelope; the caller still
//! treats the request as accepted. Within one publisher, envelopes reach the
//! topic in enqueue order.

use crate::broker::TopicWriter;
use crate::config::PublisherConfig;
use crate::event::EventEnvelope;
use crate::metrics::PublisherMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Serialized envelope owned by the publisher until the broker acknowledges it.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Lifecycle of one envelope inside the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Queued,
    /// 1-based attempt number.
    Attempting(u32),
    Delivered,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Sleep after failed attempt k is `k * backoff_base`.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }
}

impl From<&PublisherConfig> for RetryPolicy {
    fn from(cfg: &PublisherConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            attempt_timeout: cfg.attempt_timeout(),
            backoff_base: cfg.backoff_base(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub enqueued: AtomicU64,
    /// Shed at enqueue because the queue was full.
    pub dropped: AtomicU64,
    pub delivered: AtomicU64,
    /// Lost after exhausting every attempt; one per envelope.
    pub delivery_errors: AtomicU64,
    pub retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublisherSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub delivery_errors: u64,
    pub retries: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle. Cheap to clone; all clones share one queue.
#[derive(Debug, Clone)]
pub struct AsyncPublisher {
    sender: mpsc::Sender<QueuedMessage>,
    stats: Arc<PublisherStats>,
}

/// Consumer side of the publish queue, driven by a [`DeliveryLoop`].
#[derive(Debug)]
pub struct PublishQueue {
    receiver: mpsc::Receiver<QueuedMessage>,
    stats: Arc<PublisherStats>,
}

impl AsyncPublisher {
    /// Create the queue without starting delivery.
    pub fn new(capacity: usize) -> (Self, PublishQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(PublisherStats::default());
        (
            Self {
                sender,
                stats: Arc::clone(&stats),
            },
            PublishQueue { receiver, stats },
        )
    }

    /// Create the queue and spawn its delivery loop.
    pub fn start(
        writer: Arc<dyn TopicWriter>,
        config: &PublisherConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (publisher, queue) = Self::new(config.queue_capacity);
        let delivery = DeliveryLoop::new(queue, writer, RetryPolicy::from(config));
        let handle = tokio::spawn(delivery.run(shutdown));
        (publisher, handle)
    }

    /// Serialize and queue an envelope, keyed by user. Returns `false`
    /// immediately when the envelope could not be queued.
    pub fn enqueue(&self, envelope: &EventEnvelope) -> bool {
        let value = match envelope.to_json() {
            Ok(v) => v,
            Err(e) => {
                error!(user_id = %envelope.key(), error = %e, "failed to serialize envelope");
                return false;
            }
        };
        self.enqueue_raw(envelope.key().as_bytes().to_vec(), value)
    }

    pub fn enqueue_raw(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        match self.sender.try_send(QueuedMessage { key, value }) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                PublisherMetrics::record_enqueued(self.depth());
                debug!(state = ?DeliveryState::Queued, "message queued for publishing");
                true
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                PublisherMetrics::record_dropped();
                warn!(
                    user_id = %String::from_utf8_lossy(&msg.key),
                    "publish queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                PublisherMetrics::record_dropped();
                warn!(
                    user_id = %String::from_utf8_lossy(&msg.key),
                    "publish queue closed, dropping message"
                );
                false
            }
        }
    }

    /// Messages waiting for delivery.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn stats(&self) -> PublisherSnapshot {
        self.stats.snapshot()
    }
}

enum AttemptOutcome {
    Finished(DeliveryState),
    Cancelled,
}

/// The single background worker draining a [`PublishQueue`] into a topic.
pub struct DeliveryLoop {
    queue: PublishQueue,
    writer: Arc<dyn TopicWriter>,
    policy: RetryPolicy,
}

impl DeliveryLoop {
    pub fn new(queue: PublishQueue, writer: Arc<dyn TopicWriter>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            writer,
            policy,
        }
    }

    /// Deliver until shutdown or until every producer handle is dropped.
    /// Messages still queued at shutdown are abandoned.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting publisher delivery loop");
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(
                        abandoned = self.queue.receiver.len(),
                        "Shutting down publisher delivery loop"
                    );
                    return;
                }
                msg = self.queue.receiver.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        info!("Publish queue closed, delivery loop exiting");
                        return;
                    }
                },
            };

            if let AttemptOutcome::Cancelled = self.deliver(&msg, &mut shutdown).await {
                info!("Shutting down publisher delivery loop mid-delivery");
                return;
            }
        }
    }

    async fn deliver(&self, msg: &QueuedMessage, shutdown: &mut broadcast::Receiver<()>) -> AttemptOutcome {
        let started = Instant::now();
        let stats = &self.queue.stats;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            debug!(state = ?DeliveryState::Attempting(attempt), "writing to broker");
            let result = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    PublisherMetrics::record_write_duration(started.elapsed().as_secs_f64());
                    return AttemptOutcome::Cancelled;
                }
                r = tokio::time::timeout(
                    self.policy.attempt_timeout,
                    self.writer.write_message(&msg.key, &msg.value),
                ) => r,
            };

            match result {
                Ok(Ok(())) => {
                    PublisherMetrics::record_write_duration(started.elapsed().as_secs_f64());
                    PublisherMetrics::record_delivered();
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(state = ?DeliveryState::Delivered, attempt, "message delivered");
                    return AttemptOutcome::Finished(DeliveryState::Delivered);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.policy.attempt_timeout)
                }
            }
            warn!("retry {}: failed to write to broker: {}", attempt, last_error);

            if attempt < self.policy.max_attempts {
                stats.retries.fetch_add(1, Ordering::Relaxed);
                PublisherMetrics::record_retry();
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        PublisherMetrics::record_write_duration(started.elapsed().as_secs_f64());
                        return AttemptOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(self.policy.backoff_after(attempt)) => {}
                }
            }
        }

        PublisherMetrics::record_write_duration(started.elapsed().as_secs_f64());
        PublisherMetrics::record_write_error();
        stats.delivery_errors.fetch_add(1, Ordering::Relaxed);
        error!(
            user_id = %String::from_utf8_lossy(&msg.key),
            attempts = self.policy.max_attempts,
            error = %last_error,
            state = ?DeliveryState::Dropped,
            "failed to write to broker after retries"
        );
        AttemptOutcome::Finished(DeliveryState::Dropped)
    }
}
