use crate::broker::FileTopic;
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::sink::{Consistency, SinkKind};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, overridable with `LB_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "leaderboard.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub rate_limit: RateLimitConfig,
    pub sink: SinkConfig,
    pub server: ServerConfig,
    pub ranking: RankingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub topic: String,
    pub data_root: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: constants::DEFAULT_TOPIC.to_string(),
            data_root: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub backoff_base_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_attempts: 3,
            attempt_timeout_ms: 5_000,
            backoff_base_ms: 1_000,
        }
    }
}

impl PublisherConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub transient_backoff_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            transient_backoff_ms: 1_000,
            poll_interval_ms: 500,
        }
    }
}

impl ConsumerConfig {
    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_minute: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 30.0,
            burst: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Prometheus exporter for `serve`.
    pub metrics_addr: String,
    /// Exporters for the workers. Each process on a host needs its own port.
    pub durable_metrics_addr: String,
    pub aggregator_metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8085".to_string(),
            metrics_addr: "127.0.0.1:9898".to_string(),
            durable_metrics_addr: "127.0.0.1:9899".to_string(),
            aggregator_metrics_addr: "127.0.0.1:9900".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub default_mode: String,
    pub top_n: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            default_mode: constants::DEFAULT_GAME_MODE.to_string(),
            top_n: constants::DEFAULT_TOP_N,
        }
    }
}

impl Config {
    /// Load from `LB_CONFIG` or `leaderboard.toml`; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();
        let path = std::env::var("LB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() {
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.publisher.queue_capacity == 0 {
            return Err(PipelineError::Config(
                "publisher.queue_capacity must be at least 1".into(),
            ));
        }
        if self.publisher.max_attempts == 0 {
            return Err(PipelineError::Config(
                "publisher.max_attempts must be at least 1".into(),
            ));
        }
        if !(self.rate_limit.tokens_per_minute > 0.0) {
            return Err(PipelineError::Config(
                "rate_limit.tokens_per_minute must be positive".into(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(PipelineError::Config(
                "rate_limit.burst must be at least 1".into(),
            ));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(PipelineError::Config("broker.topic must not be empty".into()));
        }
        let exporters = [
            &self.server.metrics_addr,
            &self.server.durable_metrics_addr,
            &self.server.aggregator_metrics_addr,
        ];
        for (i, addr) in exporters.iter().enumerate() {
            if exporters[..i].contains(addr) {
                return Err(PipelineError::Config(format!(
                    "metrics exporter address '{}' is shared by more than one process",
                    addr
                )));
            }
        }
        Ok(())
    }

    /// Open the configured file topic under `broker.data_root`.
    pub fn open_topic(&self) -> Result<FileTopic> {
        Ok(FileTopic::open(&self.broker.data_root, &self.broker.topic)?)
    }

    /// Exporter address for the worker bound to `kind`.
    pub fn worker_metrics_addr(&self, kind: SinkKind) -> &str {
        match kind {
            SinkKind::Durable => &self.server.durable_metrics_addr,
            SinkKind::Aggregator => &self.server.aggregator_metrics_addr,
        }
    }

    /// SQLite file backing the durable sink.
    pub fn durable_db_path(&self) -> PathBuf {
        self.broker.data_root.join("sessions.db")
    }

    /// SQLite file backing the aggregator's sorted sets.
    pub fn leaderboard_db_path(&self) -> PathBuf {
        self.broker.data_root.join("leaderboard.db")
    }
}
