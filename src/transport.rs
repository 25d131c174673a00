//! Transport capabilities consumed by the router.
//!
//! A broker binding provides two things: a [`MessageSource`] that yields raw deliveries, and a
//! [`TransportAdapter`] that finalizes each delivery with exactly one of acknowledge,
//! redeliver or dead-letter. Three strategies cover the broker models this crate targets:
//!
//! | Strategy | Acknowledge | Redeliver | Dead-letter |
//! |---|---|---|---|
//! | [`OffsetCommitAdapter`] | commit past the message | wait, then rewind to it | publish to DLQ topic, commit |
//! | [`AckNackAdapter`] | ack | nack (broker-owned timing) | per [`DeadLetterMode`] |
//! | [`RequeueAdapter`] | ack | publish copy to delay queue, ack | publish copy to DLQ, ack |
//!
//! Each strategy is generic over a thin client trait ([`OffsetLog`], [`AckNackSubscription`],
//! [`RequeueChannel`]) implemented by the broker crates and by the in-process
//! [`memory`] transports.

pub mod ack_nack;
pub mod memory;
pub mod offset;
pub mod requeue;

pub use ack_nack::{AckNackAdapter, AckNackDelivery, AckNackSubscription, AdvisoryDelay, DeadLetterMode};
pub use offset::{OffsetCommitAdapter, OffsetDelivery, OffsetLog, Position};
pub use requeue::{
    topic_matches, DelayQueue, CONTENT_TYPE_JSON, KEY_HEADER, PublishProperties, RequeueAdapter, RequeueChannel,
    RequeueTopology, Route,
};

use crate::envelope::Envelope;
use crate::router::DeadLetterReason;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A message handed out by a transport, still awaiting its final action.
pub trait Delivery: Send + Sync {
    /// Raw message body.
    fn payload(&self) -> &[u8];
}

/// Failure of a transport operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{transport}: fetch failed: {message}")]
    Fetch { transport: &'static str, message: String },
    #[error("{transport}: acknowledge failed: {message}")]
    Acknowledge { transport: &'static str, message: String },
    #[error("{transport}: publish to {destination} failed: {message}")]
    Publish { transport: &'static str, destination: String, message: String },
    #[error("{transport}: connection closed")]
    Closed { transport: &'static str },
}

impl TransportError {
    pub fn fetch(transport: &'static str, err: impl fmt::Display) -> Self {
        Self::Fetch { transport, message: err.to_string() }
    }

    pub fn acknowledge(transport: &'static str, err: impl fmt::Display) -> Self {
        Self::Acknowledge { transport, message: err.to_string() }
    }

    pub fn publish(
        transport: &'static str,
        destination: impl Into<String>,
        err: impl fmt::Display,
    ) -> Self {
        Self::Publish { transport, destination: destination.into(), message: err.to_string() }
    }

    /// Whether the error came from fetching, which is fatal to a worker loop.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Closed { .. })
    }
}

/// Yields deliveries one at a time. `Ok(None)` means the stream ended cleanly.
#[async_trait]
pub trait MessageSource: Send {
    type Delivery: Delivery;

    async fn next(&mut self) -> Result<Option<Self::Delivery>, TransportError>;
}

/// Final actions available for a delivery. The router invokes exactly one per delivery.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    type Delivery: Delivery;

    /// Short transport label used in logs.
    fn name(&self) -> &'static str;

    /// Times the transport already handed out this same physical message.
    ///
    /// Transports that redeliver the unmodified original cannot carry an updated attempt count
    /// in the payload; they report it here instead.
    fn prior_deliveries(&self, _delivery: &Self::Delivery) -> u32 {
        0
    }

    /// Finalize the delivery as done.
    async fn acknowledge(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    /// Arrange for the event to be processed again after roughly `delay`.
    async fn redeliver(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), TransportError>;

    /// Deposit the event in the dead-letter sink and finalize the original.
    ///
    /// `reason` lets a transport that delegates exhaustion to the broker still dead-letter a
    /// terminal failure at once.
    async fn dead_letter(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        reason: DeadLetterReason,
    ) -> Result<(), TransportError>;
}
