use super::{BrokerError, BrokerMessage, TopicReader, TopicWriter};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Interval between file polls while a reader waits for new lines.
const FILE_POLL_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct TopicRecord {
    key: String,
    value: String,
}

/// NDJSON topic shared between processes: `<root>/topics/<name>.ndjson`, with
/// committed group offsets (byte positions) in `<root>/topics/offsets.db`.
#[derive(Debug)]
pub struct FileTopic {
    name: String,
    log_path: PathBuf,
    offsets_path: PathBuf,
    append_lock: Mutex<()>,
}

impl FileTopic {
    pub fn open<P: AsRef<Path>>(data_root: P, name: &str) -> Result<Self, BrokerError> {
        let dir = data_root.as_ref().join("topics");
        fs::create_dir_all(&dir)?;
        let topic = Self {
            name: name.to_string(),
            log_path: dir.join(format!("{name}.ndjson")),
            offsets_path: dir.join("offsets.db"),
            append_lock: Mutex::new(()),
        };
        // Create the offsets schema eagerly so readers in other processes find it
        OffsetStore::open(&topic.offsets_path)?;
        Ok(topic)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn reader(&self, group: &str, poll_interval: Duration) -> Result<FileTopicReader, BrokerError> {
        let offsets = OffsetStore::open(&self.offsets_path)?;
        let mut position = offsets.get(&self.name, group)?;
        // Handle truncation: a stored offset beyond the file end restarts from 0
        let end = self.end_offset();
        if position > end {
            warn!(topic = %self.name, group, position, end, "committed offset beyond topic end, resetting");
            position = 0;
        }
        Ok(FileTopicReader {
            topic: self.name.clone(),
            log_path: self.log_path.clone(),
            group: group.to_string(),
            position,
            poll_interval,
            offsets,
        })
    }

    fn end_offset(&self) -> u64 {
        fs::metadata(&self.log_path).map(|m| m.len()).unwrap_or(0)
    }

    /// (committed offset, end of log, lag in bytes) for a group.
    pub fn status(&self, group: &str) -> Result<(u64, u64, u64), BrokerError> {
        let committed = OffsetStore::open(&self.offsets_path)?.get(&self.name, group)?;
        let end = self.end_offset();
        Ok((committed, end, end.saturating_sub(committed)))
    }
}

#[async_trait]
impl TopicWriter for FileTopic {
    async fn write_message(&self, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let record = TopicRecord {
            key: String::from_utf8_lossy(key).into_owned(),
            value: String::from_utf8_lossy(value).into_owned(),
        };
        let line = serde_json::to_string(&record).map_err(|e| BrokerError::Corrupt {
            offset: 0,
            message: e.to_string(),
        })?;

        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        // Single write per record so concurrent appenders never interleave a line
        file.write_all(format!("{line}\n").as_bytes())?;
        debug!(topic = %self.name, bytes = line.len(), "appended record");
        Ok(())
    }
}

pub struct FileTopicReader {
    topic: String,
    log_path: PathBuf,
    group: String,
    position: u64,
    poll_interval: Duration,
    offsets: OffsetStore,
}

impl FileTopicReader {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next complete line at or after the current position.
    fn try_next(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let end = file.metadata()?.len();
        if self.position > end {
            self.position = 0;
        }
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.position))?;

        loop {
            let mut buf = String::new();
            let bytes = reader.read_line(&mut buf)?;
            if bytes == 0 || !buf.ends_with('\n') {
                // EOF, or a line whose writer has not finished it yet
                return Ok(None);
            }
            let start = self.position;
            self.position += bytes as u64;
            let line = buf.trim_end();
            if line.is_empty() {
                continue;
            }
            return match serde_json::from_str::<TopicRecord>(line) {
                Ok(record) => Ok(Some(BrokerMessage {
                    key: record.key.into_bytes(),
                    value: record.value.into_bytes(),
                    next_offset: self.position,
                })),
                Err(e) => Err(BrokerError::Corrupt {
                    offset: start,
                    message: e.to_string(),
                }),
            };
        }
    }
}

#[async_trait]
impl TopicReader for FileTopicReader {
    async fn read_message(&mut self) -> Result<BrokerMessage, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.poll_interval;
        loop {
            if let Some(message) = self.try_next()? {
                return Ok(message);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BrokerError::Eof);
            }
            tokio::time::sleep(FILE_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), BrokerError> {
        self.offsets.set(&self.topic, &self.group, offset)?;
        Ok(())
    }
}

/// Committed consumer-group offsets.
struct OffsetStore {
    conn: Connection,
}

impl OffsetStore {
    fn open(path: &Path) -> Result<Self, BrokerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS consumer_offsets (
                topic        TEXT NOT NULL,
                consumer     TEXT NOT NULL,
                byte_offset  INTEGER NOT NULL,
                PRIMARY KEY (topic, consumer)
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    fn get(&self, topic: &str, consumer: &str) -> Result<u64, BrokerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT byte_offset FROM consumer_offsets WHERE topic = ?1 AND consumer = ?2")?;
        let mut rows = stmt.query(params![topic, consumer])?;
        if let Some(row) = rows.next()? {
            let off: i64 = row.get(0)?;
            Ok(off.max(0) as u64)
        } else {
            Ok(0)
        }
    }

    fn set(&self, topic: &str, consumer: &str, byte_offset: u64) -> Result<(), BrokerError> {
        self.conn.execute(
            "INSERT INTO consumer_offsets (topic, consumer, byte_offset) VALUES (?1, ?2, ?3)
             ON CONFLICT(topic, consumer) DO UPDATE SET byte_offset=excluded.byte_offset",
            params![topic, consumer, byte_offset as i64],
        )?;
        Ok(())
    }
}
