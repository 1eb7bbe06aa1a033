use super::{Consistency, StorageSink};
use crate::error::{PipelineError, Result};
use crate::event::GameSession;
use crate::metrics::sink::SinkMetrics;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};
use uuid::Uuid;

const STORAGE_TYPE: &str = "durable";

/// Append-only session store keyed by session id.
pub struct DurableSink {
    conn: Mutex<Option<Connection>>,
    consistency: Consistency,
}

impl DurableSink {
    pub fn open<P: AsRef<Path>>(path: P, consistency: Consistency) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, consistency)
    }

    pub fn open_in_memory(consistency: Consistency) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, consistency)
    }

    fn with_connection(conn: Connection, consistency: Consistency) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous={};
            CREATE TABLE IF NOT EXISTS game_sessions (
                session_id  TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                score       INTEGER NOT NULL,
                game_mode   TEXT NOT NULL,
                timestamp   TEXT NOT NULL
            );
            "#,
            consistency.synchronous()
        ))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            consistency,
        })
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, session: &GameSession) -> Result<()> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(PipelineError::Closed("durable sink"))?;
        // Redelivered sessions keep their first record
        conn.execute(
            "INSERT INTO game_sessions (session_id, user_id, score, game_mode, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO NOTHING",
            params![
                session.session_id.to_string(),
                session.user_id,
                session.score,
                session.game_mode,
                session.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        Ok(())
    }

    /// Every stored record for a session id.
    pub fn records_for(&self, session_id: &Uuid) -> Result<Vec<GameSession>> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(PipelineError::Closed("durable sink"))?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, score, game_mode, timestamp
             FROM game_sessions WHERE session_id = ?1",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, user_id, score, game_mode, timestamp) = row?;
            sessions.push(GameSession {
                session_id: Uuid::parse_str(&id)
                    .map_err(|e| PipelineError::StoredRecord(format!("session_id {id}: {e}")))?,
                user_id,
                score,
                game_mode,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| PipelineError::StoredRecord(format!("timestamp {timestamp}: {e}")))?
                    .with_timezone(&Utc),
            });
        }
        Ok(sessions)
    }

    pub fn count(&self) -> Result<u64> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(PipelineError::Closed("durable sink"))?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM game_sessions", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[async_trait]
impl StorageSink for DurableSink {
    fn storage_type(&self) -> &'static str {
        STORAGE_TYPE
    }

    // The insert runs synchronously on the runtime thread, holding it for the
    // duration of the SQLite write.
    async fn write(&self, session: &GameSession) -> Result<()> {
        debug!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            score = session.score,
            game_mode = %session.game_mode,
            "writing session"
        );
        let _timing = SinkMetrics::time_write(STORAGE_TYPE);
        match self.insert(session) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "error writing session");
                SinkMetrics::record_write_error(STORAGE_TYPE);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if self.conn().take().is_some() {
            debug!("durable sink connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScoreSubmission;

    #[tokio::test]
    async fn write_then_read_back() {
        let sink = DurableSink::open_in_memory(Consistency::Quorum).unwrap();
        let session = GameSession::admit("3", ScoreSubmission::new(77, "classic")).unwrap();
        sink.write(&session).await.unwrap();
        assert_eq!(sink.records_for(&session.session_id).unwrap(), vec![session]);
    }

    #[tokio::test]
    async fn redelivery_keeps_one_record() {
        let sink = DurableSink::open_in_memory(Consistency::One).unwrap();
        let session = GameSession::admit("3", ScoreSubmission::new(10, "classic")).unwrap();
        sink.write(&session).await.unwrap();
        sink.write(&session).await.unwrap();
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let sink = DurableSink::open_in_memory(Consistency::All).unwrap();
        sink.close().await;
        let session = GameSession::admit("3", ScoreSubmission::new(10, "classic")).unwrap();
        let err = sink.write(&session).await.unwrap_err();
        assert!(matches!(err, PipelineError::Closed(_)));
    }
}
