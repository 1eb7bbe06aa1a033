// Wire and storage constants shared by the ingestion edge and the workers.

/// Discriminator carried by every envelope on the score topic.
pub const GAME_SCORE_RECORDED: &str = "game_score_recorded";

/// Default topic name carrying score envelopes.
pub const DEFAULT_TOPIC: &str = "game-sessions";

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 500;

/// Allowed game mode characters.
pub const GAME_MODE_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

/// Game mode served by the read surface when none is given.
pub const DEFAULT_GAME_MODE: &str = "classic";

/// Default size of a top-N query.
pub const DEFAULT_TOP_N: usize = 10;

/// Sorted-set key prefix for a game mode's leaderboard.
pub const LEADERBOARD_KEY_PREFIX: &str = "leaderboard:";

/// Sorted-set member prefix for a user.
pub const USER_MEMBER_PREFIX: &str = "user:";

pub fn leaderboard_key(game_mode: &str) -> String {
    format!("{LEADERBOARD_KEY_PREFIX}{game_mode}")
}

pub fn user_member(user_id: &str) -> String {
    format!("{USER_MEMBER_PREFIX}{user_id}")
}

/// Consumer group used by a worker bound to the given sink kind.
pub fn worker_group(sink_kind: &str) -> String {
    format!("worker-{sink_kind}")
}
