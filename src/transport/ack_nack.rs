//! Ack/nack strategy for brokers that own redelivery (Pub/Sub-style subscriptions).
//!
//! Acknowledging removes the message from the subscription's outstanding set. Redelivering is a
//! negative acknowledgment; when the message comes back is decided by the subscription's own
//! ack-deadline and retry policy. The computed delay is advisory and is only honoured locally
//! when [`AdvisoryDelay::Suspend`] is selected.
//!
//! Dead-lettering has to be explicit about where the message goes; see [`DeadLetterMode`].
//! Terminal failures are dead-lettered on the delivery that reported them in every mode: only
//! exhaustion is ever handed to a broker policy.
//!
//! Attempts are counted from the broker's delivery counter. Subscriptions that do not report
//! one (no dead-letter policy, most emulators) fall back to a per-process ledger keyed by the
//! broker message id, which only sees redeliveries that come back to this process.

use super::{Delivery, TransportAdapter, TransportError};
use crate::envelope::Envelope;
use crate::router::DeadLetterReason;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A delivery carrying the broker's own delivery counter.
pub trait AckNackDelivery: Delivery {
    /// Broker-assigned id, stable across redeliveries of the same message.
    fn message_id(&self) -> &str;

    /// 1-based count of deliveries of this message, when the broker tracks it.
    fn delivery_attempt(&self) -> Option<u32>;
}

/// Client operations the ack/nack strategy needs from a subscription.
#[async_trait]
pub trait AckNackSubscription: Send + Sync {
    type Delivery: AckNackDelivery;

    async fn ack(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    async fn nack(&self, delivery: &Self::Delivery) -> Result<(), TransportError>;

    /// Publish `payload` to the dead-letter topic, keyed by `key`.
    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>)
        -> Result<(), TransportError>;
}

/// What dead-lettering means on this subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadLetterMode {
    /// Publish a copy to an explicit dead-letter topic, then ack the original.
    #[default]
    Topic,
    /// Ack and drop with a warning. For brokers without any dead-letter facility (emulators).
    Drop,
    /// Nack exhausted messages and let the subscription's dead-letter policy forward them. The
    /// policy's maximum delivery attempts must match the router's ceiling.
    ///
    /// A terminal failure would otherwise be redelivered until the policy gives up, so it is
    /// published to the dead-letter topic and acked as in [`DeadLetterMode::Topic`].
    BrokerPolicy,
}

impl fmt::Display for DeadLetterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterMode::Topic => write!(f, "topic"),
            DeadLetterMode::Drop => write!(f, "drop"),
            DeadLetterMode::BrokerPolicy => write!(f, "broker-policy"),
        }
    }
}

/// Whether the advisory redelivery delay is slept locally before nacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvisoryDelay {
    /// Nack immediately; the broker decides the timing.
    #[default]
    Ignore,
    /// Sleep for the computed delay, then nack.
    Suspend,
}

/// [`TransportAdapter`] over a broker-managed subscription.
pub struct AckNackAdapter<S> {
    subscription: S,
    dead_letter_mode: DeadLetterMode,
    advisory_delay: AdvisoryDelay,
    sleeper: Arc<dyn Sleeper>,
    nacks: Mutex<HashMap<String, u32>>,
}

impl<S> fmt::Debug for AckNackAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckNackAdapter")
            .field("dead_letter_mode", &self.dead_letter_mode)
            .field("advisory_delay", &self.advisory_delay)
            .finish()
    }
}

impl<S: AckNackSubscription> AckNackAdapter<S> {
    pub fn new(subscription: S, dead_letter_mode: DeadLetterMode) -> Self {
        tracing::info!(mode = %dead_letter_mode, "ack/nack dead-letter behaviour");
        Self {
            subscription,
            dead_letter_mode,
            advisory_delay: AdvisoryDelay::Ignore,
            sleeper: Arc::new(TokioSleeper),
            nacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_advisory_delay(mut self, advisory_delay: AdvisoryDelay) -> Self {
        self.advisory_delay = advisory_delay;
        self
    }

    pub fn with_sleeper<Z>(mut self, sleeper: Z) -> Self
    where
        Z: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn dead_letter_mode(&self) -> DeadLetterMode {
        self.dead_letter_mode
    }

    pub fn subscription(&self) -> &S {
        &self.subscription
    }

    async fn publish_then_ack(
        &self,
        delivery: &S::Delivery,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        self.subscription.publish_dead_letter(envelope.key(), envelope.encode()).await?;
        self.acknowledge(delivery).await
    }

    fn forget(&self, delivery: &S::Delivery) {
        if delivery.delivery_attempt().is_none() {
            if let Ok(mut nacks) = self.nacks.lock() {
                nacks.remove(delivery.message_id());
            }
        }
    }
}

#[async_trait]
impl<S: AckNackSubscription> TransportAdapter for AckNackAdapter<S> {
    type Delivery = S::Delivery;

    fn name(&self) -> &'static str {
        "ack-nack"
    }

    fn prior_deliveries(&self, delivery: &Self::Delivery) -> u32 {
        match delivery.delivery_attempt() {
            Some(n) => n.saturating_sub(1),
            None => self
                .nacks
                .lock()
                .ok()
                .and_then(|n| n.get(delivery.message_id()).copied())
                .unwrap_or(0),
        }
    }

    async fn acknowledge(&self, delivery: &Self::Delivery) -> Result<(), TransportError> {
        self.subscription.ack(delivery).await?;
        self.forget(delivery);
        Ok(())
    }

    async fn redeliver(
        &self,
        delivery: &Self::Delivery,
        _envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), TransportError> {
        if self.advisory_delay == AdvisoryDelay::Suspend {
            self.sleeper.sleep(delay).await;
        }
        self.subscription.nack(delivery).await?;
        if delivery.delivery_attempt().is_none() {
            if let Ok(mut nacks) = self.nacks.lock() {
                *nacks.entry(delivery.message_id().to_string()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Self::Delivery,
        envelope: &Envelope,
        reason: DeadLetterReason,
    ) -> Result<(), TransportError> {
        match (self.dead_letter_mode, reason) {
            (DeadLetterMode::Topic, _)
            | (DeadLetterMode::BrokerPolicy, DeadLetterReason::Terminal) => {
                self.publish_then_ack(delivery, envelope).await
            }
            (DeadLetterMode::Drop, _) => {
                tracing::warn!(
                    id = envelope.id(),
                    key = envelope.key(),
                    attempts = envelope.attempts(),
                    "no dead-letter destination; dropping"
                );
                self.acknowledge(delivery).await
            }
            (DeadLetterMode::BrokerPolicy, DeadLetterReason::Exhausted) => {
                self.subscription.nack(delivery).await?;
                self.forget(delivery);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;
    use std::sync::Mutex;

    struct Message {
        id: String,
        payload: Vec<u8>,
        delivery_attempt: Option<u32>,
    }

    impl Delivery for Message {
        fn payload(&self) -> &[u8] {
            &self.payload
        }
    }

    impl AckNackDelivery for Message {
        fn message_id(&self) -> &str {
            &self.id
        }

        fn delivery_attempt(&self) -> Option<u32> {
            self.delivery_attempt
        }
    }

    #[derive(Default)]
    struct FakeSubscription {
        calls: Mutex<Vec<&'static str>>,
        fail_nack: bool,
    }

    #[async_trait]
    impl AckNackSubscription for FakeSubscription {
        type Delivery = Message;

        async fn ack(&self, _d: &Message) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, _d: &Message) -> Result<(), TransportError> {
            if self.fail_nack {
                return Err(TransportError::acknowledge("fake", "stream closed"));
            }
            self.calls.lock().unwrap().push("nack");
            Ok(())
        }

        async fn publish_dead_letter(&self, _k: &str, _p: Vec<u8>) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push("publish");
            Ok(())
        }
    }

    fn message(delivery_attempt: Option<u32>) -> (Message, Envelope) {
        let e = Envelope::new("UserUpdated", "user-2", []);
        (Message { id: "m-1".into(), payload: e.encode(), delivery_attempt }, e)
    }

    fn calls(a: &AckNackAdapter<FakeSubscription>) -> Vec<&'static str> {
        a.subscription().calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn redeliver_is_a_nack() {
        let sleeper = TrackingSleeper::new();
        let a = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::Topic)
            .with_sleeper(sleeper.clone());
        let (m, e) = message(Some(1));
        a.redeliver(&m, &e, Duration::from_secs(1)).await.unwrap();
        assert_eq!(calls(&a), vec!["nack"]);
        assert!(sleeper.requested().is_empty(), "delay is advisory by default");
    }

    #[tokio::test]
    async fn suspend_sleeps_before_nack() {
        let sleeper = TrackingSleeper::new();
        let a = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::Topic)
            .with_advisory_delay(AdvisoryDelay::Suspend)
            .with_sleeper(sleeper.clone());
        let (m, e) = message(None);
        a.redeliver(&m, &e, Duration::from_millis(500)).await.unwrap();
        assert_eq!(sleeper.requested(), vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn dead_letter_modes() {
        let (m, e) = message(Some(5));
        let exhausted = DeadLetterReason::Exhausted;

        let topic = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::Topic);
        topic.dead_letter(&m, &e, exhausted).await.unwrap();
        assert_eq!(calls(&topic), vec!["publish", "ack"]);

        let drop = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::Drop);
        drop.dead_letter(&m, &e, exhausted).await.unwrap();
        assert_eq!(calls(&drop), vec!["ack"]);

        let policy =
            AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::BrokerPolicy);
        policy.dead_letter(&m, &e, exhausted).await.unwrap();
        assert_eq!(calls(&policy), vec!["nack"]);
    }

    #[tokio::test]
    async fn broker_policy_publishes_terminal_failures_itself() {
        let (m, e) = message(Some(1));
        let policy =
            AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::BrokerPolicy);
        policy.dead_letter(&m, &e, DeadLetterReason::Terminal).await.unwrap();
        assert_eq!(calls(&policy), vec!["publish", "ack"]);
    }

    #[test]
    fn prior_deliveries_follow_broker_counter() {
        let a = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::default());
        assert_eq!(a.prior_deliveries(&message(None).0), 0);
        assert_eq!(a.prior_deliveries(&message(Some(1)).0), 0);
        assert_eq!(a.prior_deliveries(&message(Some(4)).0), 3);
    }

    #[tokio::test]
    async fn counts_nacks_locally_without_broker_counter() {
        let a = AckNackAdapter::new(FakeSubscription::default(), DeadLetterMode::default())
            .with_sleeper(TrackingSleeper::new());
        let (m, e) = message(None);
        a.redeliver(&m, &e, Duration::from_millis(500)).await.unwrap();
        a.redeliver(&m, &e, Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.prior_deliveries(&m), 2);

        a.acknowledge(&m).await.unwrap();
        assert_eq!(a.prior_deliveries(&m), 0);
    }

    #[tokio::test]
    async fn failed_nack_is_not_counted() {
        let sub = FakeSubscription { fail_nack: true, ..Default::default() };
        let a = AckNackAdapter::new(sub, DeadLetterMode::default());
        let (m, e) = message(None);
        assert!(a.redeliver(&m, &e, Duration::ZERO).await.is_err());
        assert_eq!(a.prior_deliveries(&m), 0);
    }
}
