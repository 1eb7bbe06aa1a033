use super::{BrokerError, BrokerMessage, TopicReader, TopicWriter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// In-process topic: an append log plus committed offsets per consumer group.
#[derive(Debug)]
pub struct MemoryTopic {
    name: String,
    log: Mutex<TopicLog>,
    appended: Notify,
}

#[derive(Debug, Default)]
struct TopicLog {
    messages: Vec<(Vec<u8>, Vec<u8>)>,
    committed: HashMap<String, u64>,
    closed: bool,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log: Mutex::new(TopicLog::default()),
            appended: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn log(&self) -> std::sync::MutexGuard<'_, TopicLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append raw bytes, returning the message's offset. Bypasses the writer
    /// contract so tests can inject arbitrary payloads.
    pub fn append(&self, key: &[u8], value: &[u8]) -> u64 {
        let offset = {
            let mut log = self.log();
            log.messages.push((key.to_vec(), value.to_vec()));
            (log.messages.len() - 1) as u64
        };
        self.appended.notify_waiters();
        offset
    }

    pub fn len(&self) -> usize {
        self.log().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every message value in append order.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.log().messages.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Snapshot of every message key in append order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.log().messages.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn committed(&self, group: &str) -> u64 {
        self.log().committed.get(group).copied().unwrap_or(0)
    }

    /// Stop accepting writes and wake all readers; they observe `Closed`.
    pub fn close(&self) {
        self.log().closed = true;
        self.appended.notify_waiters();
    }

    /// A reader for `group`, positioned at the group's committed offset.
    pub fn reader(self: &Arc<Self>, group: impl Into<String>, poll_interval: Duration) -> MemoryTopicReader {
        let group = group.into();
        let position = self.committed(&group);
        MemoryTopicReader {
            topic: Arc::clone(self),
            group,
            position,
            poll_interval,
        }
    }
}

#[async_trait]
impl TopicWriter for MemoryTopic {
    async fn write_message(&self, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        if self.log().closed {
            return Err(BrokerError::Closed);
        }
        let offset = self.append(key, value);
        debug!(topic = %self.name, offset, "appended message");
        Ok(())
    }
}

pub struct MemoryTopicReader {
    topic: Arc<MemoryTopic>,
    group: String,
    position: u64,
    poll_interval: Duration,
}

impl MemoryTopicReader {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn try_next(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let log = self.topic.log();
        if let Some((key, value)) = log.messages.get(self.position as usize) {
            self.position += 1;
            return Ok(Some(BrokerMessage {
                key: key.clone(),
                value: value.clone(),
                next_offset: self.position,
            }));
        }
        if log.closed {
            return Err(BrokerError::Closed);
        }
        Ok(None)
    }
}

#[async_trait]
impl TopicReader for MemoryTopicReader {
    async fn read_message(&mut self) -> Result<BrokerMessage, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.poll_interval;
        let topic = Arc::clone(&self.topic);
        loop {
            // Register interest before checking so an append in between is not missed
            let appended = topic.appended.notified();
            if let Some(message) = self.try_next()? {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Err(BrokerError::Eof);
            }
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), BrokerError> {
        self.topic.log().committed.insert(self.group.clone(), offset);
        Ok(())
    }
}
