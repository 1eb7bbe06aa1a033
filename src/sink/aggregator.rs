use super::{SortedSetStore, StorageSink};
use crate::constants::{leaderboard_key, user_member};
use crate::error::Result;
use crate::event::GameSession;
use crate::metrics::sink::SinkMetrics;
use crate::ranking::Leaderboard;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

const STORAGE_TYPE: &str = "aggregator";

/// Running score totals per (game mode, user).
///
/// Writes are increments, so a redelivered event is counted again: totals
/// reflect score processed, not score submitted.
pub struct AggregatorSink {
    store: Arc<dyn SortedSetStore>,
    closed: AtomicBool,
}

impl AggregatorSink {
    pub fn new(store: Arc<dyn SortedSetStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    /// Read surface over the same store.
    pub fn leaderboard(&self) -> Leaderboard {
        Leaderboard::new(Arc::clone(&self.store))
    }

    async fn increment(&self, session: &GameSession) -> Result<f64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::error::PipelineError::Closed("aggregator sink"));
        }
        let key = leaderboard_key(&session.game_mode);
        let member = user_member(&session.user_id);
        debug!(key = %key, member = %member, score = session.score, "updating leaderboard");
        self.store.incr_by(&key, &member, session.score as f64).await
    }
}

#[async_trait]
impl StorageSink for AggregatorSink {
    fn storage_type(&self) -> &'static str {
        STORAGE_TYPE
    }

    async fn write(&self, session: &GameSession) -> Result<()> {
        let _timing = SinkMetrics::time_write(STORAGE_TYPE);
        match self.increment(session).await {
            Ok(total) => {
                debug!(user_id = %session.user_id, total, "updated total score");
                Ok(())
            }
            Err(e) => {
                error!(user_id = %session.user_id, error = %e, "error updating leaderboard");
                SinkMetrics::record_write_error(STORAGE_TYPE);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScoreSubmission;
    use crate::ranking::RankingReader;
    use crate::sink::MemorySortedSet;

    #[tokio::test]
    async fn modes_are_kept_apart() {
        let sink = AggregatorSink::new(Arc::new(MemorySortedSet::new()));
        let a = GameSession::admit("1", ScoreSubmission::new(40, "classic")).unwrap();
        let b = GameSession::admit("1", ScoreSubmission::new(15, "blitz")).unwrap();
        sink.write(&a).await.unwrap();
        sink.write(&b).await.unwrap();

        let board = sink.leaderboard();
        assert_eq!(board.rank_of("classic", "1").await.unwrap().unwrap().score, 40.0);
        assert_eq!(board.rank_of("blitz", "1").await.unwrap().unwrap().score, 15.0);
    }
}
