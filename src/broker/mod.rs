//! Topic abstraction between the publisher and the workers.
//!
//! A topic is an append-only sequence of keyed messages. Writers append;
//! readers belong to a consumer group and resume from that group's committed
//! offset, so anything read but not committed before a crash is delivered
//! again (at-least-once).

pub mod file_topic;
pub mod memory;

pub use file_topic::FileTopic;
pub use memory::MemoryTopic;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Nothing to read yet; the caller should back off and retry.
    #[error("fetching message: EOF")]
    Eof,

    #[error("broker operation timed out")]
    Timeout,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("topic is closed")]
    Closed,

    #[error("topic I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset store error: {0}")]
    OffsetStore(#[from] rusqlite::Error),

    #[error("corrupt topic record at offset {offset}: {message}")]
    Corrupt { offset: u64, message: String },
}

impl BrokerError {
    /// Expected conditions that clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Eof | BrokerError::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Position to commit once this message has been handled.
    pub next_offset: u64,
}

#[async_trait]
pub trait TopicWriter: Send + Sync {
    async fn write_message(&self, key: &[u8], value: &[u8]) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TopicReader: Send {
    /// Next message after the reader's position. Returns [`BrokerError::Eof`]
    /// when nothing arrives within the reader's poll interval.
    async fn read_message(&mut self) -> Result<BrokerMessage, BrokerError>;

    /// Record that everything before `offset` has been handled by this group.
    async fn commit(&mut self, offset: u64) -> Result<(), BrokerError>;
}
