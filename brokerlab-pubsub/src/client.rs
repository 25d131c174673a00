use crate::config::{PubSubConfig, ACK_DEADLINE};
use async_trait::async_trait;
use brokerlab::envelope::Envelope;
use brokerlab::transport::{
    AckNackDelivery, AckNackSubscription, Delivery, MessageSource, TransportError,
};
use futures::StreamExt;
use google_cloud_googleapis::pubsub::v1::{DeadLetterPolicy, PubsubMessage};
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::{ReceivedMessage, SubscriberConfig};
use google_cloud_pubsub::subscription::{
    MessageStream, SubscribeConfig, Subscription, SubscriptionConfig,
};
use google_cloud_pubsub::topic::Topic;
use std::collections::HashMap;
use std::fmt;

const TRANSPORT: &str = "pubsub";

/// Attribute carrying the event type on published events.
pub const TYPE_ATTRIBUTE: &str = "type";

/// Attribute carrying the event key on every published message.
pub const KEY_ATTRIBUTE: &str = "key";

/// Failure while connecting or provisioning topics and subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("connecting to pub/sub: {0}")]
    Connect(String),
    #[error("provisioning {resource}: {reason}")]
    Provision { resource: String, reason: String },
}

impl SetupError {
    fn provision(resource: &str, err: impl fmt::Display) -> Self {
        SetupError::Provision { resource: resource.to_string(), reason: err.to_string() }
    }
}

/// Connect to Pub/Sub, or to the emulator when `PUBSUB_EMULATOR_HOST` is set.
pub async fn connect(config: &PubSubConfig) -> Result<Client, SetupError> {
    let mut client_config =
        ClientConfig { project_id: Some(config.project.clone()), ..ClientConfig::default() };
    if std::env::var_os("PUBSUB_EMULATOR_HOST").is_none() {
        client_config =
            client_config.with_auth().await.map_err(|e| SetupError::Connect(e.to_string()))?;
    }
    Client::new(client_config).await.map_err(|e| SetupError::Connect(e.to_string()))
}

/// The named topic, created if missing.
pub async fn ensure_topic(client: &Client, name: &str) -> Result<Topic, SetupError> {
    let topic = client.topic(name);
    if !topic.exists(None).await.map_err(|e| SetupError::provision(name, e))? {
        topic.create(None, None).await.map_err(|e| SetupError::provision(name, e))?;
        tracing::info!(topic = name, "created topic");
    }
    Ok(topic)
}

/// The configured subscription on the configured topic, created if missing.
///
/// With `policy_attempts` set the subscription forwards to the dead-letter topic after that
/// many deliveries. An existing subscription is used as is.
pub async fn ensure_subscription(
    client: &Client,
    config: &PubSubConfig,
    policy_attempts: Option<u32>,
) -> Result<Subscription, SetupError> {
    let topic = ensure_topic(client, &config.topic).await?;
    let dead_letter_policy = match policy_attempts {
        Some(max) => {
            let dlq = ensure_topic(client, &config.dlq_topic).await?;
            Some(DeadLetterPolicy {
                dead_letter_topic: dlq.fully_qualified_name().to_string(),
                max_delivery_attempts: max as i32,
            })
        }
        None => None,
    };

    let name = config.subscription.as_str();
    let subscription = client.subscription(name);
    if !subscription.exists(None).await.map_err(|e| SetupError::provision(name, e))? {
        let settings = SubscriptionConfig {
            ack_deadline_seconds: ACK_DEADLINE.as_secs() as i32,
            dead_letter_policy,
            ..SubscriptionConfig::default()
        };
        subscription
            .create(topic.fully_qualified_name(), settings, None)
            .await
            .map_err(|e| SetupError::provision(name, e))?;
        tracing::info!(subscription = name, topic = %config.topic, "created subscription");
    }
    Ok(subscription)
}

/// A message pulled by a [`PubSubSource`].
pub struct PubSubDelivery {
    message: ReceivedMessage,
}

impl fmt::Debug for PubSubDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubDelivery")
            .field("message_id", &self.message.message.message_id)
            .field("delivery_attempt", &self.delivery_attempt())
            .finish()
    }
}

impl Delivery for PubSubDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.message.data
    }
}

impl AckNackDelivery for PubSubDelivery {
    fn message_id(&self) -> &str {
        &self.message.message.message_id
    }

    fn delivery_attempt(&self) -> Option<u32> {
        self.message.delivery_attempt().and_then(|n| u32::try_from(n).ok())
    }
}

/// A streaming pull on the subscription.
pub struct PubSubSource {
    stream: MessageStream,
}

impl PubSubSource {
    pub async fn open(
        subscription: &Subscription,
        max_outstanding: i64,
    ) -> Result<Self, TransportError> {
        let subscriber_config = SubscriberConfig {
            max_outstanding_messages: max_outstanding,
            stream_ack_deadline_seconds: ACK_DEADLINE.as_secs() as i32,
            ..SubscriberConfig::default()
        };
        let stream = subscription
            .subscribe(Some(SubscribeConfig::default().with_subscriber_config(subscriber_config)))
            .await
            .map_err(|e| TransportError::fetch(TRANSPORT, e))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl MessageSource for PubSubSource {
    type Delivery = PubSubDelivery;

    async fn next(&mut self) -> Result<Option<PubSubDelivery>, TransportError> {
        Ok(self.stream.next().await.map(|message| PubSubDelivery { message }))
    }
}

/// Ack, nack and dead-letter publishing for [`brokerlab::transport::AckNackAdapter`].
pub struct PubSubSubscription {
    dead_letters: Option<PubSubPublisher>,
}

impl fmt::Debug for PubSubSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubSubscription").field("dead_letters", &self.dead_letters).finish()
    }
}

impl PubSubSubscription {
    /// `dead_letters` receives copies in [`brokerlab::transport::DeadLetterMode::Topic`], and
    /// terminal failures in `BrokerPolicy` mode. `Drop` never publishes.
    pub fn new(dead_letters: Option<PubSubPublisher>) -> Self {
        Self { dead_letters }
    }
}

#[async_trait]
impl AckNackSubscription for PubSubSubscription {
    type Delivery = PubSubDelivery;

    async fn ack(&self, delivery: &PubSubDelivery) -> Result<(), TransportError> {
        delivery.message.ack().await.map_err(|e| TransportError::acknowledge(TRANSPORT, e))
    }

    async fn nack(&self, delivery: &PubSubDelivery) -> Result<(), TransportError> {
        delivery.message.nack().await.map_err(|e| TransportError::acknowledge(TRANSPORT, e))
    }

    async fn publish_dead_letter(&self, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        match &self.dead_letters {
            Some(publisher) => publisher.send(key, HashMap::new(), payload).await,
            None => Err(TransportError::publish(TRANSPORT, "dead-letter", "no dead-letter topic")),
        }
    }
}

/// Publishes to one topic.
pub struct PubSubPublisher {
    topic: String,
    publisher: Publisher,
}

impl fmt::Debug for PubSubPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubPublisher").field("topic", &self.topic).finish()
    }
}

impl Clone for PubSubPublisher {
    fn clone(&self) -> Self {
        Self { topic: self.topic.clone(), publisher: self.publisher.clone() }
    }
}

impl PubSubPublisher {
    pub fn new(topic: &Topic) -> Self {
        Self {
            topic: topic.fully_qualified_name().to_string(),
            publisher: topic.new_publisher(None),
        }
    }

    /// Publish an event, tagged with its type.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let attributes =
            HashMap::from([(TYPE_ATTRIBUTE.to_string(), envelope.event_type().to_string())]);
        self.send(envelope.key(), attributes, envelope.encode()).await
    }

    async fn send(
        &self,
        key: &str,
        mut attributes: HashMap<String, String>,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        attributes.insert(KEY_ATTRIBUTE.to_string(), key.to_string());
        let message = PubsubMessage { data, attributes, ..PubsubMessage::default() };
        self.publisher
            .publish(message)
            .await
            .get()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::publish(TRANSPORT, self.topic.clone(), e))
    }

    /// Flush buffered messages and stop the background publisher tasks.
    pub async fn shutdown(&mut self) {
        self.publisher.shutdown().await;
    }
}
