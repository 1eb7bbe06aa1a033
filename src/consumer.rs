//! Worker loop: topic → envelope → one storage sink.
//!
//! Each message is handled exactly once per read and then committed, whether
//! it was applied, malformed, or rejected by the sink. Redelivery only happens
//! when the worker stops between handling a message and committing it.

use crate::broker::{BrokerError, BrokerMessage, TopicReader};
use crate::config::ConsumerConfig;
use crate::constants::GAME_SCORE_RECORDED;
use crate::event::EventEnvelope;
use crate::metrics::ConsumerMetrics;
use crate::sink::StorageSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub processed: AtomicU64,
    /// Malformed or unknown messages skipped.
    pub decode_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub read_errors: AtomicU64,
    pub commit_errors: AtomicU64,
    by_game_mode: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub processed: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub commit_errors: u64,
    pub by_game_mode: HashMap<String, u64>,
}

impl ConsumerSnapshot {
    /// Messages that were read but not applied.
    pub fn errors(&self) -> u64 {
        self.decode_errors + self.write_errors
    }
}

impl ConsumerStats {
    fn record_game_mode(&self, game_mode: &str) {
        let mut modes = self
            .by_game_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *modes.entry(game_mode.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            by_game_mode: self
                .by_game_mode
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Outcome of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Applied { game_mode: String },
    Malformed,
    UnknownEvent(String),
    SinkFailed,
}

pub struct Consumer<R: TopicReader> {
    reader: R,
    sink: Arc<dyn StorageSink>,
    backoff: Duration,
    stats: Arc<ConsumerStats>,
}

impl<R: TopicReader> Consumer<R> {
    pub fn new(reader: R, sink: Arc<dyn StorageSink>, config: &ConsumerConfig) -> Self {
        Self {
            reader,
            sink,
            backoff: config.transient_backoff(),
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Shared handle to the counters, readable while the loop runs.
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Process messages until shutdown. A message already read is finished
    /// and committed before the loop exits. The sink is left open.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ConsumerSnapshot {
        info!(sink = self.sink.storage_type(), "Starting consumer");
        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                r = self.reader.read_message() => r,
            };

            match read {
                Ok(message) => {
                    handle_message(self.sink.as_ref(), &self.stats, &message).await;
                    if let Err(e) = self.reader.commit(message.next_offset).await {
                        self.stats.commit_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(offset = message.next_offset, error = %e, "failed to commit offset");
                    }
                }
                Err(BrokerError::Closed) => {
                    info!("Topic closed, consumer exiting");
                    break;
                }
                Err(e) => {
                    if e.is_transient() {
                        debug!(error = %e, "no message available, backing off");
                    } else {
                        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        ConsumerMetrics::record_read_error();
                        error!(error = %e, "error reading message");
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        info!(sink = self.sink.storage_type(), "Shutting down consumer");
        self.stats.snapshot()
    }

    /// Decode one message and apply it to the sink. Never retries.
    pub async fn handle(&self, message: &BrokerMessage) -> Handled {
        handle_message(self.sink.as_ref(), &self.stats, message).await
    }
}

// Borrows only the sink and counters, so a reader that is not `Sync` can
// still be driven from a spawned task.
async fn handle_message(sink: &dyn StorageSink, stats: &ConsumerStats, message: &BrokerMessage) -> Handled {
    let started = Instant::now();

    let envelope = match EventEnvelope::from_json(&message.value) {
        Ok(envelope) => envelope,
        Err(e) => {
            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            ConsumerMetrics::record_processing_error("decode", started.elapsed().as_secs_f64());
            error!(offset = message.next_offset, error = %e, "error unmarshaling message");
            return Handled::Malformed;
        }
    };

    if envelope.event_type != GAME_SCORE_RECORDED {
        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        ConsumerMetrics::record_processing_error("unknown_event", started.elapsed().as_secs_f64());
        warn!(event_type = %envelope.event_type, "skipping unknown event type");
        return Handled::UnknownEvent(envelope.event_type);
    }

    let session = envelope.session;
    if let Err(e) = sink.write(&session).await {
        stats.write_errors.fetch_add(1, Ordering::Relaxed);
        ConsumerMetrics::record_processing_error("sink_write", started.elapsed().as_secs_f64());
        error!(
            sink = sink.storage_type(),
            session_id = %session.session_id,
            error = %e,
            "error writing to storage"
        );
        return Handled::SinkFailed;
    }

    stats.processed.fetch_add(1, Ordering::Relaxed);
    stats.record_game_mode(&session.game_mode);
    ConsumerMetrics::record_processed(&session.game_mode, started.elapsed().as_secs_f64());
    debug!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        score = session.score,
        "processed game session"
    );
    Handled::Applied {
        game_mode: session.game_mode,
    }
}
