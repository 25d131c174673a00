use super::lock;
use crate::envelope::Envelope;
use crate::transport::{Delivery, MessageSource, OffsetDelivery, OffsetLog, Position, TransportError};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const TRANSPORT: &str = "memory-log";

/// A record stored in the log or its dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct LogState {
    topic: String,
    partitions: Vec<Vec<LogRecord>>,
    fetch: Vec<i64>,
    committed: Vec<i64>,
    dead_letters: Vec<LogRecord>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LogState>,
    changed: Notify,
}

/// Partitioned log consumed by a single consumer group.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let state = LogState {
            topic: topic.into(),
            partitions: vec![Vec::new(); partitions],
            fetch: vec![0; partitions],
            committed: vec![0; partitions],
            dead_letters: Vec::new(),
            closed: false,
        };
        Self { shared: Arc::new(Shared { state: Mutex::new(state), changed: Notify::new() }) }
    }

    pub fn partitions(&self) -> i32 {
        lock(&self.shared.state).partitions.len() as i32
    }

    /// Partition a key hashes to. Stable for the life of the log.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions() as u64) as i32
    }

    /// Append a record to the partition owning `key`.
    pub fn produce(&self, key: &str, payload: Vec<u8>) -> Position {
        let partition = self.partition_for(key);
        let position = {
            let mut guard = lock(&self.shared.state);
            let state = &mut *guard;
            let records = &mut state.partitions[partition as usize];
            records.push(LogRecord { key: key.to_string(), payload });
            Position { topic: state.topic.clone(), partition, offset: records.len() as i64 - 1 }
        };
        self.shared.changed.notify_waiters();
        position
    }

    pub fn produce_envelope(&self, envelope: &Envelope) -> Position {
        self.produce(envelope.key(), envelope.encode())
    }

    /// A consumer assigned the given partitions.
    pub fn consumer(&self, partitions: impl IntoIterator<Item = i32>) -> LogConsumer {
        LogConsumer { shared: self.shared.clone(), assigned: partitions.into_iter().collect(), cursor: 0 }
    }

    /// One consumer per partition.
    pub fn consumers(&self) -> Vec<LogConsumer> {
        (0..self.partitions()).map(|p| self.consumer([p])).collect()
    }

    /// No more records will be produced.
    pub fn close(&self) {
        lock(&self.shared.state).closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Committed offset (next offset to consume) for a partition.
    pub fn committed(&self, partition: i32) -> i64 {
        lock(&self.shared.state).committed.get(partition as usize).copied().unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<LogRecord> {
        lock(&self.shared.state).dead_letters.clone()
    }
}

/// A record fetched from the log.
#[derive(Debug, Clone)]
pub struct LogDelivery {
    position: Position,
    record: LogRecord,
}

impl LogDelivery {
    pub fn key(&self) -> &str {
        &self.record.key
    }
}

impl Delivery for LogDelivery {
    fn payload(&self) -> &[u8] {
        &self.record.payload
    }
}

impl OffsetDelivery for LogDelivery {
    fn position(&self) -> &Position {
        &self.position
    }
}

/// Fetches from a fixed set of partitions, round-robin.
#[derive(Debug)]
pub struct LogConsumer {
    shared: Arc<Shared>,
    assigned: Vec<i32>,
    cursor: usize,
}

impl LogConsumer {
    fn try_fetch(&mut self) -> Option<LogDelivery> {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        for step in 0..self.assigned.len() {
            let partition = self.assigned[(self.cursor + step) % self.assigned.len()];
            let idx = partition as usize;
            let Some(records) = state.partitions.get(idx) else { continue };
            let offset = state.fetch[idx];
            let Some(record) = records.get(offset as usize).cloned() else { continue };
            state.fetch[idx] = offset + 1;
            self.cursor = (self.cursor + step + 1) % self.assigned.len();
            let position = Position { topic: state.topic.clone(), partition, offset };
            return Some(LogDelivery { position, record });
        }
        None
    }
}

#[async_trait]
impl MessageSource for LogConsumer {
    type Delivery = LogDelivery;

    async fn next(&mut self) -> Result<Option<LogDelivery>, TransportError> {
        if self.assigned.is_empty() {
            return Ok(None);
        }
        let shared = self.shared.clone();
        loop {
            let changed = shared.changed.notified();
            if let Some(delivery) = self.try_fetch() {
                return Ok(Some(delivery));
            }
            if lock(&shared.state).closed {
                return Ok(None);
            }
            changed.await;
        }
    }
}

#[async_trait]
impl OffsetLog for MemoryLog {
    type Delivery = LogDelivery;

    async fn commit(&self, delivery: &LogDelivery) -> Result<(), TransportError> {
        let mut state = lock(&self.shared.state);
        let idx = delivery.position.partition as usize;
        let slot = state
            .committed
            .get_mut(idx)
            .ok_or_else(|| TransportError::acknowledge(TRANSPORT, "unknown partition"))?;
        *slot = (*slot).max(delivery.position.offset + 1);
        Ok(())
    }

    async fn rewind(&self, delivery: &LogDelivery) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.shared.state);
            let idx = delivery.position.partition as usize;
            let slot = state
                .fetch
                .get_mut(idx)
                .ok_or_else(|| TransportError::acknowledge(TRANSPORT, "unknown partition"))?;
            *slot = delivery.position.offset;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        lock(&self.shared.state).dead_letters.push(LogRecord { key: key.to_string(), payload });
        Ok(())
    }
}
