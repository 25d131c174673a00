use super::lock;
use crate::envelope::Envelope;
use crate::transport::{
    AckNackDelivery, AckNackSubscription, Delivery, MessageSource, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const TRANSPORT: &str = "memory-subscription";

#[derive(Debug)]
struct Stored {
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    next_id: u64,
    messages: HashMap<u64, Stored>,
    pending: VecDeque<u64>,
    outstanding: usize,
    acked: u64,
    nacked: u64,
    dead_letters: Vec<(String, Vec<u8>)>,
    report_attempts: bool,
    max_delivery_attempts: Option<u32>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SubscriptionState>,
    changed: Notify,
}

/// Subscription whose broker owns redelivery: nacked messages go straight back to the queue.
#[derive(Debug, Clone)]
pub struct MemorySubscription {
    shared: Arc<Shared>,
}

impl Default for MemorySubscription {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySubscription {
    /// A subscription that reports delivery attempts on every message.
    pub fn new() -> Self {
        let shared = Shared::default();
        lock(&shared.state).report_attempts = true;
        Self { shared: Arc::new(shared) }
    }

    /// Stop reporting delivery attempts, like a subscription without a dead-letter policy.
    pub fn without_delivery_attempts(self) -> Self {
        lock(&self.shared.state).report_attempts = false;
        self
    }

    /// Forward a message to the dead-letter list once it has been delivered `max` times and
    /// is nacked again.
    pub fn with_dead_letter_policy(self, max: u32) -> Self {
        lock(&self.shared.state).max_delivery_attempts = Some(max);
        self
    }

    pub fn publish(&self, payload: Vec<u8>) {
        {
            let mut state = lock(&self.shared.state);
            let id = state.next_id;
            state.next_id += 1;
            state.messages.insert(id, Stored { payload, deliveries: 0 });
            state.pending.push_back(id);
        }
        self.shared.changed.notify_waiters();
    }

    pub fn publish_envelope(&self, envelope: &Envelope) {
        self.publish(envelope.encode());
    }

    /// A pull stream on this subscription. Several may run at once.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber { shared: self.shared.clone() }
    }

    pub fn close(&self) {
        lock(&self.shared.state).closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Messages delivered but neither acked nor nacked.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.state).outstanding
    }

    pub fn acked(&self) -> u64 {
        lock(&self.shared.state).acked
    }

    pub fn nacked(&self) -> u64 {
        lock(&self.shared.state).nacked
    }

    /// Dead-lettered `(key, payload)` pairs, oldest first. Keys are empty for messages moved
    /// by the dead-letter policy.
    pub fn dead_letters(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.shared.state).dead_letters.clone()
    }

    fn settle(&self, delivery: &SubscriptionMessage, requeue: bool) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.shared.state);
            if !state.messages.contains_key(&delivery.ack_id) {
                return Err(TransportError::acknowledge(TRANSPORT, "unknown or expired ack id"));
            }
            state.outstanding = state.outstanding.saturating_sub(1);
            if !requeue {
                state.messages.remove(&delivery.ack_id);
                state.acked += 1;
            } else {
                state.nacked += 1;
                let exhausted = match (state.max_delivery_attempts, state.messages.get(&delivery.ack_id)) {
                    (Some(max), Some(stored)) => stored.deliveries >= max,
                    _ => false,
                };
                if exhausted {
                    if let Some(stored) = state.messages.remove(&delivery.ack_id) {
                        state.dead_letters.push((String::new(), stored.payload));
                    }
                } else {
                    state.pending.push_back(delivery.ack_id);
                }
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

/// A message pulled from the subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionMessage {
    ack_id: u64,
    message_id: String,
    payload: Vec<u8>,
    delivery_attempt: Option<u32>,
}

impl Delivery for SubscriptionMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl AckNackDelivery for SubscriptionMessage {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn delivery_attempt(&self) -> Option<u32> {
        self.delivery_attempt
    }
}

/// Pull stream over a [`MemorySubscription`].
#[derive(Debug)]
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    fn try_pull(&self) -> Option<SubscriptionMessage> {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        let ack_id = state.pending.pop_front()?;
        let stored = state.messages.get_mut(&ack_id)?;
        stored.deliveries += 1;
        let message = SubscriptionMessage {
            ack_id,
            message_id: ack_id.to_string(),
            payload: stored.payload.clone(),
            delivery_attempt: state.report_attempts.then_some(stored.deliveries),
        };
        state.outstanding += 1;
        Some(message)
    }

    fn drained(&self) -> bool {
        let state = lock(&self.shared.state);
        state.closed && state.pending.is_empty() && state.outstanding == 0
    }
}

#[async_trait]
impl MessageSource for Subscriber {
    type Delivery = SubscriptionMessage;

    async fn next(&mut self) -> Result<Option<SubscriptionMessage>, TransportError> {
        loop {
            let changed = self.shared.changed.notified();
            if let Some(message) = self.try_pull() {
                return Ok(Some(message));
            }
            if self.drained() {
                return Ok(None);
            }
            changed.await;
        }
    }
}

#[async_trait]
impl AckNackSubscription for MemorySubscription {
    type Delivery = SubscriptionMessage;

    async fn ack(&self, delivery: &SubscriptionMessage) -> Result<(), TransportError> {
        self.settle(delivery, false)
    }

    async fn nack(&self, delivery: &SubscriptionMessage) -> Result<(), TransportError> {
        self.settle(delivery, true)
    }

    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        lock(&self.shared.state).dead_letters.push((key.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let sub = MemorySubscription::new();
        sub.publish(b"m".to_vec());
        let mut rx = sub.subscriber();

        let first = rx.next().await.unwrap().unwrap();
        assert_eq!(first.delivery_attempt(), Some(1));
        assert_eq!(sub.outstanding(), 1);
        sub.nack(&first).await.unwrap();

        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(second.delivery_attempt(), Some(2));
        sub.ack(&second).await.unwrap();
        assert_eq!(sub.outstanding(), 0);
        assert_eq!((sub.acked(), sub.nacked()), (1, 1));
    }

    #[tokio::test]
    async fn acked_message_cannot_be_settled_twice() {
        let sub = MemorySubscription::new();
        sub.publish(b"m".to_vec());
        let m = sub.subscriber().next().await.unwrap().unwrap();
        sub.ack(&m).await.unwrap();
        assert!(sub.ack(&m).await.is_err());
    }

    #[tokio::test]
    async fn dead_letter_policy_forwards_after_max_deliveries() {
        let sub = MemorySubscription::new().with_dead_letter_policy(2);
        sub.publish(b"m".to_vec());
        sub.close();
        let mut rx = sub.subscriber();

        let m = rx.next().await.unwrap().unwrap();
        sub.nack(&m).await.unwrap();
        let m = rx.next().await.unwrap().unwrap();
        sub.nack(&m).await.unwrap();

        assert!(rx.next().await.unwrap().is_none());
        assert_eq!(sub.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn attempts_can_be_hidden() {
        let sub = MemorySubscription::new().without_delivery_attempts();
        sub.publish(b"m".to_vec());
        let m = sub.subscriber().next().await.unwrap().unwrap();
        assert_eq!(m.delivery_attempt(), None);
    }

    #[tokio::test]
    async fn closed_subscription_waits_for_outstanding() {
        let sub = MemorySubscription::new();
        sub.publish(b"m".to_vec());
        sub.close();
        let mut rx = sub.subscriber();
        let m = rx.next().await.unwrap().unwrap();

        let mut other = sub.subscriber();
        let waiter = tokio::spawn(async move { other.next().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        sub.ack(&m).await.unwrap();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
