use crate::config::{KafkaConfig, MESSAGE_TIMEOUT};
use async_trait::async_trait;
use brokerlab::envelope::Envelope;
use brokerlab::transport::{
    Delivery, MessageSource, OffsetDelivery, OffsetLog, Position, TransportError,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TRANSPORT: &str = "kafka";
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn client_config(settings: Vec<(&'static str, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

/// A group consumer subscribed to the configured topic.
pub fn create_consumer(config: &KafkaConfig) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = client_config(config.consumer_settings()).create()?;
    consumer.subscribe(&[config.topic.as_str()])?;
    Ok(consumer)
}

pub fn create_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    client_config(config.producer_settings()).create()
}

/// A record fetched by a [`KafkaSource`]. Remembers its consumer so commits and seeks reach
/// the group member that owns the partition.
pub struct KafkaDelivery {
    consumer: Arc<StreamConsumer>,
    message: OwnedMessage,
    position: Position,
}

impl fmt::Debug for KafkaDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaDelivery").field("position", &self.position).finish()
    }
}

impl KafkaDelivery {
    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }
}

impl Delivery for KafkaDelivery {
    fn payload(&self) -> &[u8] {
        self.message.payload().unwrap_or_default()
    }
}

impl OffsetDelivery for KafkaDelivery {
    fn position(&self) -> &Position {
        &self.position
    }
}

/// Pulls records from one group member.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
}

impl KafkaSource {
    pub fn new(consumer: StreamConsumer) -> Self {
        Self { consumer: Arc::new(consumer) }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    type Delivery = KafkaDelivery;

    async fn next(&mut self) -> Result<Option<KafkaDelivery>, TransportError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| TransportError::fetch(TRANSPORT, e))?
            .detach();
        let position = Position {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        Ok(Some(KafkaDelivery { consumer: self.consumer.clone(), message, position }))
    }
}

/// Commits, seeks and dead-letter writes for [`brokerlab::transport::OffsetCommitAdapter`].
#[derive(Clone)]
pub struct KafkaLog {
    producer: FutureProducer,
    dlq_topic: String,
}

impl fmt::Debug for KafkaLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaLog").field("dlq_topic", &self.dlq_topic).finish()
    }
}

impl KafkaLog {
    pub fn new(producer: FutureProducer, dlq_topic: impl Into<String>) -> Self {
        Self { producer, dlq_topic: dlq_topic.into() }
    }
}

#[async_trait]
impl OffsetLog for KafkaLog {
    type Delivery = KafkaDelivery;

    async fn commit(&self, delivery: &KafkaDelivery) -> Result<(), TransportError> {
        let p = &delivery.position;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&p.topic, p.partition, Offset::Offset(p.offset + 1))
            .map_err(|e| TransportError::acknowledge(TRANSPORT, e))?;
        delivery
            .consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| TransportError::acknowledge(TRANSPORT, e))
    }

    async fn rewind(&self, delivery: &KafkaDelivery) -> Result<(), TransportError> {
        let consumer = delivery.consumer.clone();
        let p = delivery.position.clone();
        tokio::task::spawn_blocking(move || {
            consumer.seek(&p.topic, p.partition, Offset::Offset(p.offset), SEEK_TIMEOUT)
        })
        .await
        .map_err(|e| TransportError::acknowledge(TRANSPORT, e))?
        .map_err(|e| TransportError::acknowledge(TRANSPORT, e))
    }

    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let record = FutureRecord::to(&self.dlq_topic).key(key).payload(&payload);
        self.producer
            .send(record, Timeout::After(MESSAGE_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| TransportError::publish(TRANSPORT, self.dlq_topic.clone(), e))
    }
}

/// Writes fresh events keyed by their routing key.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaPublisher").field("topic", &self.topic).finish()
    }
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self { producer, topic: topic.into() }
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let payload = envelope.encode();
        let record = FutureRecord::to(&self.topic).key(envelope.key()).payload(&payload);
        self.producer
            .send(record, Timeout::After(MESSAGE_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| TransportError::publish(TRANSPORT, self.topic.clone(), e))
    }
}
