//! Offset-commit strategy for cursor-based logs (Kafka-style consumer groups).
//!
//! Acknowledging commits the group's position past the message, so it is never handed to this
//! group again. Redelivering leaves the position where it is: the adapter waits out the backoff
//! on the consuming task, then rewinds the consumer so the unmodified original is fetched
//! again.
//!
//! The wait happens on the worker that owns the partition. Nothing else on that partition is
//! processed until it returns (head-of-line blocking). This is a property of the model: the log
//! has no per-message delay primitive. Routing retries through a separate retry topic avoids it
//! at the cost of per-key ordering.
//!
//! Because the payload is never rewritten, the adapter remembers how many times it rewound to
//! each position and reports that through [`TransportAdapter::prior_deliveries`].
//!
//! By the time an action runs the consumer has already fetched past the record, and the next
//! commit on the partition would cover it. So when a commit or dead-letter publish fails the
//! adapter rewinds to the record before returning the error, and the record is fetched again.
//! If that rewind fails too, nothing stops a later commit from skipping the record; the
//! adapter then reports a fetch-class error ([`TransportError::is_fetch`]) so the worker
//! stops consuming the partition.

use super::{Delivery, TransportAdapter, TransportError};
use crate::envelope::Envelope;
use crate::router::DeadLetterReason;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Location of a record in a partitioned log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A delivery that knows where it sits in the log.
pub trait OffsetDelivery: Delivery {
    fn position(&self) -> &Position;
}

/// Client operations the offset-commit strategy needs from a log consumer.
#[async_trait]
pub trait OffsetLog: Send + Sync {
    type Delivery: OffsetDelivery;

    /// Commit the group's position to just past `delivery`.
    async fn commit(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    /// Move the fetch position back so `delivery` is the next record returned.
    async fn rewind(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    /// Append `payload` to the dead-letter topic under `key`.
    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>)
        -> Result<(), TransportError>;
}

/// [`TransportAdapter`] over a cursor-based log.
pub struct OffsetCommitAdapter<L> {
    log: L,
    sleeper: Arc<dyn Sleeper>,
    rewinds: Mutex<HashMap<Position, u32>>,
}

impl<L> fmt::Debug for OffsetCommitAdapter<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetCommitAdapter")
            .field("sleeper", &self.sleeper)
            .field("pending_rewinds", &self.pending_rewinds())
            .finish()
    }
}

impl<L: OffsetLog> OffsetCommitAdapter<L> {
    pub fn new(log: L) -> Self {
        Self { log, sleeper: Arc::new(TokioSleeper), rewinds: Mutex::new(HashMap::new()) }
    }

    /// Replace the sleeper used to wait out backoff delays.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    fn forget(&self, position: &Position) {
        if let Ok(mut rewinds) = self.rewinds.lock() {
            rewinds.remove(position);
        }
    }

    /// Put the record back in front of the consumer after `failed`, or escalate.
    async fn restore(&self, delivery: &L::Delivery, failed: TransportError) -> TransportError {
        let position = delivery.position();
        match self.log.rewind(delivery).await {
            Ok(()) => {
                tracing::warn!(%position, error = %failed, "action failed; rewound to the record");
                failed
            }
            Err(rewind) => {
                tracing::error!(%position, error = %failed, %rewind, "action and rewind failed");
                TransportError::fetch(
                    "offset-commit",
                    format!("{position} is behind the fetch position after: {failed}; {rewind}"),
                )
            }
        }
    }
}

#[async_trait]
impl<L: OffsetLog> TransportAdapter for OffsetCommitAdapter<L> {
    type Delivery = L::Delivery;

    fn name(&self) -> &'static str {
        "offset-commit"
    }

    fn prior_deliveries(&self, delivery: &Self::Delivery) -> u32 {
        self.rewinds
            .lock()
            .ok()
            .and_then(|r| r.get(delivery.position()).copied())
            .unwrap_or(0)
    }

    async fn acknowledge(&self, delivery: &Self::Delivery) -> Result<(), TransportError> {
        if let Err(err) = self.log.commit(delivery).await {
            return Err(self.restore(delivery, err).await);
        }
        self.forget(delivery.position());
        Ok(())
    }

    async fn redeliver(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), TransportError> {
        tracing::debug!(
            position = %delivery.position(),
            id = envelope.id(),
            delay_ms = delay.as_millis() as u64,
            "holding partition for backoff"
        );
        self.sleeper.sleep(delay).await;
        if let Err(err) = self.log.rewind(delivery).await {
            tracing::error!(position = %delivery.position(), error = %err, "rewind failed");
            return Err(TransportError::fetch(
                "offset-commit",
                format!("{} is behind the fetch position: {err}", delivery.position()),
            ));
        }
        if let Ok(mut rewinds) = self.rewinds.lock() {
            *rewinds.entry(delivery.position().clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        reason: DeadLetterReason,
    ) -> Result<(), TransportError> {
        if let Err(err) = self.log.publish_dead_letter(envelope.key(), envelope.encode()).await {
            return Err(self.restore(delivery, err).await);
        }
        tracing::debug!(
            position = %delivery.position(),
            id = envelope.id(),
            %reason,
            "published to dead-letter topic"
        );
        self.acknowledge(delivery).await
    }
}
