//! Kafka transport for `brokerlab` (companion crate).
//!
//! Kafka is an offset-commit log: a record is finished by committing past it, and there is no
//! broker-side delay. Pair [`KafkaLog`] with [`brokerlab::transport::OffsetCommitAdapter`]:
//! retries hold the partition for the backoff, seek back, and re-fetch the unmodified record.
//! Dead letters go to a separate topic keyed like the original.
//!
//! The configuration ([`KafkaConfig`]) is always available. The librdkafka-backed client and
//! the `kafka-worker` / `kafka-producer` binaries need the `client` feature.

mod config;

pub use config::{KafkaConfig, MESSAGE_TIMEOUT};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{
    create_consumer, create_producer, KafkaDelivery, KafkaLog, KafkaPublisher, KafkaSource,
};
