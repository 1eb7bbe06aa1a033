use crate::constants::{GAME_MODE_PATTERN, GAME_SCORE_RECORDED, MAX_SCORE, MIN_SCORE};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static GAME_MODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(GAME_MODE_PATTERN).expect("game mode pattern compiles"));

/// A candidate score as submitted by a client, before admission.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ScoreSubmission {
    pub score: i64,
    pub game_mode: String,
}

impl ScoreSubmission {
    pub fn new(score: i64, game_mode: impl Into<String>) -> Self {
        Self {
            score,
            game_mode: game_mode.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.score < MIN_SCORE || self.score > MAX_SCORE {
            return Err(PipelineError::Validation("invalid score value".into()));
        }
        if !GAME_MODE_RE.is_match(&self.game_mode) {
            return Err(PipelineError::Validation("invalid game mode format".into()));
        }
        Ok(())
    }
}

/// An admitted game result. Immutable once built by [`GameSession::admit`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GameSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub score: i64,
    pub game_mode: String,
    pub timestamp: DateTime<Utc>,
}

impl GameSession {
    /// Validate a submission and stamp it with a fresh time-ordered id.
    pub fn admit(user_id: impl Into<String>, submission: ScoreSubmission) -> Result<Self> {
        submission.validate()?;
        let session_id = Uuid::now_v7();
        Ok(Self {
            timestamp: timestamp_of(&session_id),
            session_id,
            user_id: user_id.into(),
            score: submission.score,
            game_mode: submission.game_mode,
        })
    }
}

/// Instant encoded in a time-ordered (v7) id, or now for ids without one.
pub fn timestamp_of(id: &Uuid) -> DateTime<Utc> {
    id.get_timestamp()
        .and_then(|ts| {
            let (secs, nanos) = ts.to_unix();
            DateTime::from_timestamp(secs as i64, nanos)
        })
        .unwrap_or_else(Utc::now)
}

/// The unit transported on the topic; consumers dispatch on `event_type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: String,
    pub session: GameSession,
}

impl EventEnvelope {
    pub fn score_recorded(session: GameSession) -> Self {
        Self {
            event_type: GAME_SCORE_RECORDED.to_string(),
            session,
        }
    }

    /// Partition key: all of a user's events land on the same partition.
    pub fn key(&self) -> &str {
        &self.session.user_id
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
