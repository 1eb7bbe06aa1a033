use crate::broker::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for principal {principal_id}")]
    Throttled { principal_id: u64 },

    #[error("JSON deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{sink} write failed: {message}")]
    SinkWrite { sink: &'static str, message: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Corrupt stored record: {0}")]
    StoredRecord(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0} is closed")]
    Closed(&'static str),
}

impl PipelineError {
    /// Whether the caller could reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Throttled { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
