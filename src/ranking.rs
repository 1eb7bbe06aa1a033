//! Read-only ranking queries over the aggregator's sorted sets.

use crate::constants::{leaderboard_key, user_member, USER_MEMBER_PREFIX};
use crate::error::Result;
use crate::sink::SortedSetStore;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingEntry {
    pub user_id: String,
    pub score: f64,
    /// 1-based position, highest score first.
    pub rank: u64,
}

#[async_trait]
pub trait RankingReader: Send + Sync {
    /// Highest totals first; ties follow the store's ordering.
    async fn top_n(&self, game_mode: &str, n: usize) -> Result<Vec<RankingEntry>>;

    async fn rank_of(&self, game_mode: &str, user_id: &str) -> Result<Option<RankingEntry>>;
}

/// [`RankingReader`] over a sorted-set store. No caching: every call sees all
/// increments applied before it.
#[derive(Clone)]
pub struct Leaderboard {
    store: Arc<dyn SortedSetStore>,
}

impl Leaderboard {
    pub fn new(store: Arc<dyn SortedSetStore>) -> Self {
        Self { store }
    }
}

fn user_id_of(member: &str) -> &str {
    member.strip_prefix(USER_MEMBER_PREFIX).unwrap_or(member)
}

#[async_trait]
impl RankingReader for Leaderboard {
    async fn top_n(&self, game_mode: &str, n: usize) -> Result<Vec<RankingEntry>> {
        let members = self
            .store
            .rev_range_with_scores(&leaderboard_key(game_mode), 0, n)
            .await?;
        Ok(members
            .into_iter()
            .enumerate()
            .map(|(i, (member, score))| RankingEntry {
                user_id: user_id_of(&member).to_string(),
                score,
                rank: i as u64 + 1,
            })
            .collect())
    }

    async fn rank_of(&self, game_mode: &str, user_id: &str) -> Result<Option<RankingEntry>> {
        let key = leaderboard_key(game_mode);
        let member = user_member(user_id);
        let Some(score) = self.store.score(&key, &member).await? else {
            return Ok(None);
        };
        let Some(rank) = self.store.rev_rank(&key, &member).await? else {
            // removed between the two reads
            return Ok(None);
        };
        Ok(Some(RankingEntry {
            user_id: user_id.to_string(),
            score,
            rank: rank + 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySortedSet;

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let board = Leaderboard::new(Arc::new(MemorySortedSet::new()));
        assert!(board.rank_of("classic", "404").await.unwrap().is_none());
        assert!(board.top_n("classic", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_do_not_mutate() {
        let store = Arc::new(MemorySortedSet::new());
        store.incr_by("leaderboard:classic", "user:1", 12.0).await.unwrap();
        let board = Leaderboard::new(store.clone());
        board.top_n("classic", 10).await.unwrap();
        board.rank_of("classic", "1").await.unwrap();
        board.rank_of("classic", "2").await.unwrap();
        assert_eq!(store.score("leaderboard:classic", "user:1").await.unwrap(), Some(12.0));
        assert_eq!(store.score("leaderboard:classic", "user:2").await.unwrap(), None);
    }
}
