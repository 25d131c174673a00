//! Google Cloud Pub/Sub transport for `brokerlab` (companion crate).
//!
//! Pub/Sub owns redelivery: a nacked message comes back after the subscription's retry policy
//! decides, and the broker counts deliveries only when a dead-letter policy is attached. Pair
//! [`PubSubSubscription`] with [`brokerlab::transport::AckNackAdapter`]; the adapter falls back
//! to counting nacks by message id when the broker reports no attempt count (the emulator).
//!
//! Dead-lettering follows [`PubSubConfig::dead_letter`]: publish a copy to the dead-letter
//! topic (default), drop, or leave it to the subscription's own policy.
//!
//! The configuration is always available. The gRPC client and the `pubsub-worker` /
//! `pubsub-producer` binaries need the `client` feature.

mod config;

pub use config::{DeadLetterArg, PubSubConfig, UnsupportedPolicy, ACK_DEADLINE, POLICY_ATTEMPTS};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{
    connect, ensure_subscription, ensure_topic, PubSubDelivery, PubSubPublisher, PubSubSource,
    PubSubSubscription, SetupError, KEY_ATTRIBUTE, TYPE_ATTRIBUTE,
};
