//! Storage sinks: the terminal side effects of the score pipeline.
//!
//! A worker drives exactly one sink. To get both durability and ranking, run
//! two workers on the same topic, each in its own consumer group.

pub mod aggregator;
pub mod durable;
pub mod sorted_set;

pub use aggregator::AggregatorSink;
pub use durable::DurableSink;
pub use sorted_set::{MemorySortedSet, SortedSetStore, SqliteSortedSet};

use crate::config::Config;
use crate::error::Result;
use crate::event::GameSession;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Label used in logs and the `storage_type` metric label.
    fn storage_type(&self) -> &'static str;

    /// Apply one event. Failures are returned unmodified; sinks do not retry.
    async fn write(&self, session: &GameSession) -> Result<()>;

    /// Release the backing connection. Later writes fail.
    async fn close(&self);
}

/// Startup switch selecting the sink a worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Durable,
    Aggregator,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Durable => "durable",
            SinkKind::Aggregator => "aggregator",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durability level for the durable sink's writes and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    One,
    #[default]
    Quorum,
    All,
}

impl Consistency {
    /// SQLite `synchronous` setting implementing this level.
    pub fn synchronous(&self) -> &'static str {
        match self {
            Consistency::One => "OFF",
            Consistency::Quorum => "NORMAL",
            Consistency::All => "FULL",
        }
    }
}

/// Build the sink selected by `config.sink.kind`.
pub fn build_sink(config: &Config) -> Result<Arc<dyn StorageSink>> {
    std::fs::create_dir_all(&config.broker.data_root)?;
    let sink: Arc<dyn StorageSink> = match config.sink.kind {
        SinkKind::Durable => Arc::new(DurableSink::open(
            config.durable_db_path(),
            config.sink.consistency,
        )?),
        SinkKind::Aggregator => {
            let store = SqliteSortedSet::open(config.leaderboard_db_path())?;
            Arc::new(AggregatorSink::new(Arc::new(store)))
        }
    };
    info!(sink = sink.storage_type(), "storage sink ready");
    Ok(sink)
}
