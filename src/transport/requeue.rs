//! Requeue strategy for brokers with explicit delay queues (RabbitMQ-style exchanges).
//!
//! A retry is a brand-new message: the adapter publishes a copy of the envelope (attempt count
//! and key carried forward) to a delay queue whose time-to-live equals the backoff, then acks
//! the original. When the copy expires, the delay queue dead-letters it back to the main
//! exchange under the main routing key.
//!
//! Because the retry is a new message, it re-enters the main queue behind whatever arrived in
//! the meantime. Per-key ordering is not preserved once an event has been retried.
//!
//! Topology (names derived by [`RequeueTopology`]):
//!
//! ```text
//! producer -> <exchange> (topic) --<routing key>--> <queue>
//! worker   -> <exchange>.dlx (direct) --retry.<ms>ms--> <queue>.retry.<ms>ms
//!                                                          (ttl <ms>, dlx back to <exchange>/<routing key>)
//! worker   -> <exchange>.dlx (direct) --dlq--> <queue>.dlq
//! ```

use super::{Delivery, TransportAdapter, TransportError};
use crate::envelope::Envelope;
use crate::router::DeadLetterReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// JSON content type set on every published copy.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Header carrying the event key on published copies.
pub const KEY_HEADER: &str = "x-event-key";

/// Exchange plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self { exchange: exchange.into(), routing_key: routing_key.into() }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Message properties for a published copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: String,
    pub key: String,
    pub content_type: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Per-message time-to-live.
    pub expiration: Option<Duration>,
}

impl PublishProperties {
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.id().to_string(),
            key: envelope.key().to_string(),
            content_type: CONTENT_TYPE_JSON,
            timestamp: Utc::now(),
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }
}

/// A delay queue: messages expire after `ttl` and are re-routed to the main path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueue {
    pub name: String,
    pub routing_key: String,
    pub ttl: Duration,
}

/// Names of every exchange, queue and routing key the requeue strategy publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueTopology {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl RequeueTopology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self { exchange: exchange.into(), queue: queue.into(), routing_key: routing_key.into() }
    }

    /// Topic exchange producers publish to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Queue the workers consume.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Binding pattern / routing key for the main queue.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Direct exchange used for retries and dead letters.
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    /// Route that lands back on the main queue.
    pub fn main_route(&self) -> Route {
        Route::new(self.exchange.clone(), self.routing_key.clone())
    }

    /// Route into the delay queue for `delay`.
    pub fn retry_route(&self, delay: Duration) -> Route {
        Route::new(self.dead_letter_exchange(), retry_routing_key(delay))
    }

    /// Route into the terminal dead-letter queue.
    pub fn dead_letter_route(&self) -> Route {
        Route::new(self.dead_letter_exchange(), "dlq")
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }

    /// Delay queue for one backoff step.
    pub fn delay_queue(&self, delay: Duration) -> DelayQueue {
        DelayQueue {
            name: format!("{}.retry.{}ms", self.queue, delay.as_millis()),
            routing_key: retry_routing_key(delay),
            ttl: delay,
        }
    }

    /// Delay queues for every step in `schedule`.
    pub fn delay_queues(&self, schedule: &[Duration]) -> Vec<DelayQueue> {
        schedule.iter().map(|d| self.delay_queue(*d)).collect()
    }
}

fn retry_routing_key(delay: Duration) -> String {
    format!("retry.{}ms", delay.as_millis())
}

/// AMQP topic matching: words are `.`-separated, `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() { Vec::new() } else { routing_key.split('.').collect() };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => matches_words(rest, key_rest),
            _ => false,
        },
    }
}

/// Client operations the requeue strategy needs from a channel.
#[async_trait]
pub trait RequeueChannel: Send + Sync {
    type Delivery: Delivery;

    async fn ack(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    async fn publish(
        &self,
        route: &Route,
        properties: &PublishProperties,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// [`TransportAdapter`] that materializes retries as delayed copies.
#[derive(Debug)]
pub struct RequeueAdapter<C> {
    channel: C,
    topology: RequeueTopology,
}

impl<C: RequeueChannel> RequeueAdapter<C> {
    pub fn new(channel: C, topology: RequeueTopology) -> Self {
        Self { channel, topology }
    }

    pub fn topology(&self) -> &RequeueTopology {
        &self.topology
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait]
impl<C: RequeueChannel> TransportAdapter for RequeueAdapter<C> {
    type Delivery = C::Delivery;

    fn name(&self) -> &'static str {
        "requeue"
    }

    async fn acknowledge(&self, delivery: &Self::Delivery) -> Result<(), TransportError> {
        self.channel.ack(delivery).await
    }

    async fn redeliver(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), TransportError> {
        let route = self.topology.retry_route(delay);
        let properties = PublishProperties::for_envelope(envelope).with_expiration(delay);
        self.channel.publish(&route, &properties, envelope.encode()).await?;
        self.channel.ack(delivery).await
    }

    async fn dead_letter(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        _reason: DeadLetterReason,
    ) -> Result<(), TransportError> {
        let route = self.topology.dead_letter_route();
        let properties = PublishProperties::for_envelope(envelope);
        self.channel.publish(&route, &properties, envelope.encode()).await?;
        self.channel.ack(delivery).await
    }
}
