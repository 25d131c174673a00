//! RabbitMQ transport for `brokerlab` (companion crate).
//!
//! RabbitMQ has no native delayed redelivery, so [`RabbitChannel`] backs
//! [`brokerlab::transport::RequeueAdapter`]: a retry is a copy published to a per-delay queue
//! whose TTL dead-letters it back to the main exchange, and the original is acked. Exhausted
//! and terminal messages go to `<queue>.dlq` through the `<exchange>.dlx` direct exchange.
//! [`declare_topology`] creates all of it for a given backoff schedule.
//!
//! The configuration is always available. The lapin client and the `rabbitmq-worker` /
//! `rabbitmq-producer` binaries need the `client` feature.

mod config;

pub use config::RabbitConfig;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{connect, declare_topology, RabbitChannel, RabbitDelivery, RabbitSource};
