use super::lock;
use crate::envelope::Envelope;
use crate::transport::{
    topic_matches, Delivery, MessageSource, PublishProperties, RequeueChannel, RequeueTopology,
    Route, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const TRANSPORT: &str = "memory-exchange";

/// A message sitting in one of the exchange's queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessage {
    pub properties: PublishProperties,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct ExchangeState {
    ready: VecDeque<ExchangeMessage>,
    unacked: HashMap<u64, ExchangeMessage>,
    next_tag: u64,
    delayed: usize,
    dead_letters: Vec<ExchangeMessage>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    topology: RequeueTopology,
    delay_queues: HashMap<String, Duration>,
    state: Mutex<ExchangeState>,
    changed: Notify,
}

impl Shared {
    fn enqueue(&self, message: ExchangeMessage) {
        lock(&self.state).ready.push_back(message);
        self.changed.notify_waiters();
    }
}

/// Topic exchange with one main queue, a delay queue per backoff step and a dead-letter queue.
///
/// Messages published to a delay queue expire after the queue's ttl (or the message's own
/// expiration, whichever is shorter) and re-enter the main queue at the back.
#[derive(Debug, Clone)]
pub struct MemoryExchange {
    shared: Arc<Shared>,
}

impl MemoryExchange {
    /// Declare the topology with one delay queue per entry of `schedule`.
    pub fn new(topology: RequeueTopology, schedule: &[Duration]) -> Self {
        let delay_queues = topology
            .delay_queues(schedule)
            .into_iter()
            .map(|q| (q.routing_key, q.ttl))
            .collect();
        Self {
            shared: Arc::new(Shared {
                topology,
                delay_queues,
                state: Mutex::new(ExchangeState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn topology(&self) -> &RequeueTopology {
        &self.shared.topology
    }

    /// Publish a fresh event to the main exchange, the way a producer does.
    pub fn publish_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let route = self.shared.topology.main_route();
        self.route(&route, PublishProperties::for_envelope(envelope), envelope.encode())
    }

    /// A consumer on the main queue.
    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer { shared: self.shared.clone() }
    }

    /// No more messages will be published by producers. Consumers still drain delayed retries.
    pub fn close(&self) {
        lock(&self.shared.state).closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Messages waiting in the main queue.
    pub fn ready(&self) -> usize {
        lock(&self.shared.state).ready.len()
    }

    /// Messages waiting in delay queues.
    pub fn delayed(&self) -> usize {
        lock(&self.shared.state).delayed
    }

    pub fn unacked(&self) -> usize {
        lock(&self.shared.state).unacked.len()
    }

    pub fn dead_letters(&self) -> Vec<ExchangeMessage> {
        lock(&self.shared.state).dead_letters.clone()
    }

    fn route(
        &self,
        route: &Route,
        properties: PublishProperties,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let topology = &self.shared.topology;
        let message = ExchangeMessage { properties, payload };

        if route.exchange == topology.exchange()
            && topic_matches(topology.routing_key(), &route.routing_key)
        {
            self.shared.enqueue(message);
            return Ok(());
        }

        if route.exchange == topology.dead_letter_exchange() {
            if *route == topology.dead_letter_route() {
                lock(&self.shared.state).dead_letters.push(message);
                return Ok(());
            }
            if let Some(ttl) = self.shared.delay_queues.get(&route.routing_key) {
                let wait = message.properties.expiration.map_or(*ttl, |e| e.min(*ttl));
                lock(&self.shared.state).delayed += 1;
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    {
                        let mut state = lock(&shared.state);
                        state.delayed -= 1;
                        state.ready.push_back(message);
                    }
                    shared.changed.notify_waiters();
                });
                return Ok(());
            }
        }

        Err(TransportError::publish(TRANSPORT, route.to_string(), "unroutable"))
    }
}

#[async_trait]
impl RequeueChannel for MemoryExchange {
    type Delivery = QueueDelivery;

    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), TransportError> {
        let removed = lock(&self.shared.state).unacked.remove(&delivery.tag);
        if removed.is_none() {
            return Err(TransportError::acknowledge(TRANSPORT, "unknown delivery tag"));
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn publish(
        &self,
        route: &Route,
        properties: &PublishProperties,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.route(route, properties.clone(), payload)
    }
}

/// A message delivered from the main queue.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    tag: u64,
    message: ExchangeMessage,
}

impl QueueDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }

    pub fn properties(&self) -> &PublishProperties {
        &self.message.properties
    }
}

impl Delivery for QueueDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }
}

/// Consumer on the main queue.
///
/// Ends once the exchange is closed and nothing is ready, delayed or unacked.
#[derive(Debug)]
pub struct QueueConsumer {
    shared: Arc<Shared>,
}

impl QueueConsumer {
    fn try_consume(&self) -> Option<QueueDelivery> {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        let message = state.ready.pop_front()?;
        let tag = state.next_tag;
        state.next_tag += 1;
        state.unacked.insert(tag, message.clone());
        Some(QueueDelivery { tag, message })
    }

    fn drained(&self) -> bool {
        let state = lock(&self.shared.state);
        state.closed && state.ready.is_empty() && state.delayed == 0 && state.unacked.is_empty()
    }
}

#[async_trait]
impl MessageSource for QueueConsumer {
    type Delivery = QueueDelivery;

    async fn next(&mut self) -> Result<Option<QueueDelivery>, TransportError> {
        loop {
            let changed = self.shared.changed.notified();
            if let Some(delivery) = self.try_consume() {
                return Ok(Some(delivery));
            }
            if self.drained() {
                return Ok(None);
            }
            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn exchange() -> MemoryExchange {
        let schedule = [Duration::from_millis(500), Duration::from_secs(1)];
        MemoryExchange::new(RequeueTopology::new("events.x", "worker.q", "user.*"), &schedule)
    }

    #[tokio::test]
    async fn main_route_uses_topic_binding() {
        let x = exchange();
        let props = PublishProperties::for_envelope(&Envelope::new("UserUpdated", "user.1", []));
        x.publish(&Route::new("events.x", "user.updated"), &props, b"a".to_vec()).await.unwrap();
        assert_eq!(x.ready(), 1);

        let err = x.publish(&Route::new("events.x", "order.placed"), &props, b"b".to_vec()).await;
        assert!(err.is_err());
        let err = x.publish(&Route::new("events.x.dlx", "retry.42ms"), &props, b"c".to_vec()).await;
        assert!(err.is_err(), "no delay queue declared for 42ms");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_copy_returns_after_ttl() {
        let x = exchange();
        let e = Envelope::new("UserUpdated", "user.1", []);
        let props = PublishProperties::for_envelope(&e).with_expiration(Duration::from_secs(1));
        let start = Instant::now();
        x.publish(&x.topology().retry_route(Duration::from_secs(1)), &props, e.encode())
            .await
            .unwrap();
        assert_eq!((x.ready(), x.delayed()), (0, 1));

        let got = x.consumer().next().await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(got.properties().message_id, e.id());
        assert_eq!(x.delayed(), 0);
    }

    #[tokio::test]
    async fn ack_clears_unacked_and_consumer_ends_when_drained() {
        let x = exchange();
        x.publish_envelope(&Envelope::new("UserUpdated", "user.1", [])).unwrap();
        x.close();

        let mut c = x.consumer();
        let d = c.next().await.unwrap().unwrap();
        assert_eq!(x.unacked(), 1);
        x.ack(&d).await.unwrap();
        assert!(x.ack(&d).await.is_err());
        assert!(c.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_route_lands_in_dlq() {
        let x = exchange();
        let e = Envelope::new("UserUpdated", "user.1", []);
        let props = PublishProperties::for_envelope(&e);
        x.publish(&x.topology().dead_letter_route(), &props, e.encode()).await.unwrap();
        assert_eq!(x.dead_letters().len(), 1);
        assert_eq!(x.ready(), 0);
    }
}
