//! Sorted sets keyed by string: member -> score, ordered by score.
//!
//! Descending order breaks ties by member, also descending, matching the
//! reverse-range semantics of common sorted-set servers.

use crate::error::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Add `delta` to a member's score (starting from 0) and return the new score.
    async fn incr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64>;

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// 0-based position counting from the highest score.
    async fn rev_rank(&self, key: &str, member: &str) -> Result<Option<u64>>;

    /// Up to `count` members starting at `offset`, highest score first.
    async fn rev_range_with_scores(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>>;
}

#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SetData {
    scores: HashMap<String, f64>,
    // ascending (score, member)
    index: BTreeSet<(Score, String)>,
}

impl SetData {
    fn incr(&mut self, member: &str, delta: f64) -> f64 {
        let old = self.scores.get(member).copied();
        if let Some(old) = old {
            self.index.remove(&(Score(old), member.to_string()));
        }
        let new = old.unwrap_or(0.0) + delta;
        self.scores.insert(member.to_string(), new);
        self.index.insert((Score(new), member.to_string()));
        new
    }
}

/// In-process sorted sets.
#[derive(Debug, Default)]
pub struct MemorySortedSet {
    sets: Mutex<HashMap<String, SetData>>,
}

impl MemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<String, SetData>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSet {
    async fn incr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        Ok(self.sets().entry(key.to_string()).or_default().incr(member, delta))
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.sets().get(key).and_then(|set| set.scores.get(member).copied()))
    }

    async fn rev_rank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let sets = self.sets();
        let Some(set) = sets.get(key) else {
            return Ok(None);
        };
        let Some(score) = set.scores.get(member).copied() else {
            return Ok(None);
        };
        let entry = (Score(score), member.to_string());
        // Everything strictly after this entry in ascending order ranks above it
        let above = set
            .index
            .range((std::ops::Bound::Excluded(entry), std::ops::Bound::Unbounded))
            .count();
        Ok(Some(above as u64))
    }

    async fn rev_range_with_scores(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>> {
        let sets = self.sets();
        Ok(sets
            .get(key)
            .map(|set| {
                set.index
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(count)
                    .map(|(score, member)| (member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Sorted sets persisted in SQLite, so ranking survives worker restarts and
/// can be read from another process.
pub struct SqliteSortedSet {
    conn: Mutex<Connection>,
}

impl SqliteSortedSet {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS sorted_sets (
                set_key  TEXT NOT NULL,
                member   TEXT NOT NULL,
                score    REAL NOT NULL,
                PRIMARY KEY (set_key, member)
            );
            CREATE INDEX IF NOT EXISTS sorted_sets_by_score
                ON sorted_sets (set_key, score DESC, member DESC);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SortedSetStore for SqliteSortedSet {
    // Statements run inline on the calling runtime thread; each is a single
    // indexed row, but a busy worker blocks that thread while SQLite works.
    async fn incr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let conn = self.conn();
        let score = conn.query_row(
            "INSERT INTO sorted_sets (set_key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(set_key, member) DO UPDATE SET score = score + excluded.score
             RETURNING score",
            params![key, member, delta],
            |row| row.get(0),
        )?;
        Ok(score)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let conn = self.conn();
        let score = conn
            .query_row(
                "SELECT score FROM sorted_sets WHERE set_key = ?1 AND member = ?2",
                params![key, member],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score)
    }

    async fn rev_rank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let Some(score) = self.score(key, member).await? else {
            return Ok(None);
        };
        let conn = self.conn();
        let above: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sorted_sets
             WHERE set_key = ?1 AND (score > ?2 OR (score = ?2 AND member > ?3))",
            params![key, score, member],
            |row| row.get(0),
        )?;
        Ok(Some(above as u64))
    }

    async fn rev_range_with_scores(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT member, score FROM sorted_sets WHERE set_key = ?1
             ORDER BY score DESC, member DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![key, count as i64, offset as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn SortedSetStore) {
        assert_eq!(store.incr_by("lb", "a", 50.0).await.unwrap(), 50.0);
        store.incr_by("lb", "b", 30.0).await.unwrap();
        store.incr_by("lb", "c", 80.0).await.unwrap();
        assert_eq!(store.incr_by("lb", "b", 5.0).await.unwrap(), 35.0);

        assert_eq!(store.score("lb", "b").await.unwrap(), Some(35.0));
        assert_eq!(store.score("lb", "zz").await.unwrap(), None);
        assert_eq!(store.score("other", "a").await.unwrap(), None);

        assert_eq!(store.rev_rank("lb", "c").await.unwrap(), Some(0));
        assert_eq!(store.rev_rank("lb", "a").await.unwrap(), Some(1));
        assert_eq!(store.rev_rank("lb", "b").await.unwrap(), Some(2));
        assert_eq!(store.rev_rank("lb", "zz").await.unwrap(), None);

        let top = store.rev_range_with_scores("lb", 0, 2).await.unwrap();
        assert_eq!(top, vec![("c".to_string(), 80.0), ("a".to_string(), 50.0)]);
        let rest = store.rev_range_with_scores("lb", 2, 10).await.unwrap();
        assert_eq!(rest, vec![("b".to_string(), 35.0)]);
    }

    async fn ties_by_member_descending(store: &dyn SortedSetStore) {
        store.incr_by("t", "user:1", 10.0).await.unwrap();
        store.incr_by("t", "user:2", 10.0).await.unwrap();
        let top = store.rev_range_with_scores("t", 0, 10).await.unwrap();
        assert_eq!(top[0].0, "user:2");
        assert_eq!(store.rev_rank("t", "user:2").await.unwrap(), Some(0));
        assert_eq!(store.rev_rank("t", "user:1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemorySortedSet::new()).await;
        ties_by_member_descending(&MemorySortedSet::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_semantics() {
        exercise(&SqliteSortedSet::open_in_memory().unwrap()).await;
        ties_by_member_descending(&SqliteSortedSet::open_in_memory().unwrap()).await;
    }
}
