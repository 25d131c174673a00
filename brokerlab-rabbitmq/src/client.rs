use crate::config::RabbitConfig;
use async_trait::async_trait;
use brokerlab::envelope::Envelope;
use brokerlab::transport::{
    Delivery, MessageSource, PublishProperties, RequeueChannel, RequeueTopology, Route,
    TransportError, KEY_HEADER,
};
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::fmt;
use std::time::Duration;

const TRANSPORT: &str = "rabbitmq";
const PERSISTENT: u8 = 2;

/// Open a connection and a publisher-confirm channel with the configured prefetch.
pub async fn connect(config: &RabbitConfig) -> Result<(Connection, Channel), lapin::Error> {
    let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel.basic_qos(config.prefetch, BasicQosOptions::default()).await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    Ok((connection, channel))
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

/// Declare the main exchange and queue, one delay queue per step of `schedule` and the
/// dead-letter queue. Declarations are idempotent for matching arguments.
pub async fn declare_topology(
    channel: &Channel,
    topology: &RequeueTopology,
    schedule: &[Duration],
) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions { durable: true, ..ExchangeDeclareOptions::default() };
    let dlx = topology.dead_letter_exchange();
    channel
        .exchange_declare(topology.exchange(), ExchangeKind::Topic, durable, FieldTable::default())
        .await?;
    channel.exchange_declare(&dlx, ExchangeKind::Direct, durable, FieldTable::default()).await?;

    channel.queue_declare(topology.queue(), durable_queue(), FieldTable::default()).await?;
    channel
        .queue_bind(
            topology.queue(),
            topology.exchange(),
            topology.routing_key(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    for delay in topology.delay_queues(schedule) {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(delay.ttl.as_millis() as i64),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            long_string(topology.exchange()),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            long_string(topology.routing_key()),
        );
        channel.queue_declare(&delay.name, durable_queue(), arguments).await?;
        channel
            .queue_bind(
                &delay.name,
                &dlx,
                &delay.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(
            queue = %delay.name,
            ttl_ms = delay.ttl.as_millis() as u64,
            "declared delay queue"
        );
    }

    let dead_letters = topology.dead_letter_queue();
    let dlq_route = topology.dead_letter_route();
    channel.queue_declare(&dead_letters, durable_queue(), FieldTable::default()).await?;
    channel
        .queue_bind(
            &dead_letters,
            &dlx,
            &dlq_route.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

fn amqp_properties(properties: &PublishProperties) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(ShortString::from(KEY_HEADER), long_string(&properties.key));
    let basic = BasicProperties::default()
        .with_message_id(ShortString::from(properties.message_id.as_str()))
        .with_content_type(ShortString::from(properties.content_type))
        .with_timestamp(properties.timestamp.timestamp().max(0) as u64)
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    match properties.expiration {
        Some(ttl) => basic.with_expiration(ShortString::from(ttl.as_millis().to_string())),
        None => basic,
    }
}

/// A message consumed by a [`RabbitSource`].
pub struct RabbitDelivery {
    inner: AmqpDelivery,
}

impl fmt::Debug for RabbitDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitDelivery")
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("redelivered", &self.inner.redelivered)
            .finish()
    }
}

impl RabbitDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }
}

impl Delivery for RabbitDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }
}

/// Consumer on the main queue.
pub struct RabbitSource {
    consumer: Consumer,
}

impl RabbitSource {
    pub async fn open(channel: &Channel, queue: &str, tag: &str) -> Result<Self, TransportError> {
        let consumer = channel
            .basic_consume(queue, tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| TransportError::fetch(TRANSPORT, e))?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for RabbitSource {
    type Delivery = RabbitDelivery;

    async fn next(&mut self) -> Result<Option<RabbitDelivery>, TransportError> {
        match self.consumer.next().await {
            Some(Ok(inner)) => Ok(Some(RabbitDelivery { inner })),
            Some(Err(e)) => Err(TransportError::fetch(TRANSPORT, e)),
            None => Ok(None),
        }
    }
}

/// Publishing and acknowledgement for [`brokerlab::transport::RequeueAdapter`].
///
/// Every publish is confirmed. Retry and dead-letter copies are also mandatory: an unroutable
/// copy is an error, so the original is never acked when its retry went nowhere.
#[derive(Clone)]
pub struct RabbitChannel {
    channel: Channel,
}

impl fmt::Debug for RabbitChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitChannel").field("id", &self.channel.id()).finish()
    }
}

impl RabbitChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publish a fresh event on the topology's main route. Unlike retry copies, an event with
    /// no bound queue yet is accepted and dropped by the broker.
    pub async fn publish_envelope(
        &self,
        topology: &RequeueTopology,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let properties = PublishProperties::for_envelope(envelope);
        self.send(&topology.main_route(), &properties, envelope.encode(), false).await
    }

    async fn send(
        &self,
        route: &Route,
        properties: &PublishProperties,
        payload: Vec<u8>,
        mandatory: bool,
    ) -> Result<(), TransportError> {
        let failed =
            |e: &dyn fmt::Display| TransportError::publish(TRANSPORT, route.to_string(), e);
        let options = BasicPublishOptions { mandatory, ..BasicPublishOptions::default() };
        let confirmation = self
            .channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                options,
                &payload,
                amqp_properties(properties),
            )
            .await
            .map_err(|e| failed(&e))?
            .await
            .map_err(|e| failed(&e))?;
        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(failed(&"unroutable")),
            Confirmation::Nack(_) => Err(failed(&"rejected by broker")),
        }
    }
}

#[async_trait]
impl RequeueChannel for RabbitChannel {
    type Delivery = RabbitDelivery;

    async fn ack(&self, delivery: &RabbitDelivery) -> Result<(), TransportError> {
        delivery
            .inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::acknowledge(TRANSPORT, e))
    }

    async fn publish(
        &self,
        route: &Route,
        properties: &PublishProperties,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.send(route, properties, payload, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_copies_carry_expiration_and_key_header() {
        let envelope = Envelope::new("UserUpdated", "user.1", []);
        let properties =
            PublishProperties::for_envelope(&envelope).with_expiration(Duration::from_millis(1500));
        let basic = amqp_properties(&properties);

        assert_eq!(basic.expiration().as_ref().map(|e| e.as_str()), Some("1500"));
        assert_eq!(basic.message_id().as_ref().map(|m| m.as_str()), Some(envelope.id()));
        assert_eq!(basic.content_type().as_ref().map(|c| c.as_str()), Some("application/json"));
        let headers = basic.headers().as_ref().expect("headers set");
        assert!(headers.inner().contains_key(&ShortString::from(KEY_HEADER)));
    }

    #[test]
    fn fresh_events_have_no_expiration() {
        let envelope = Envelope::new("UserUpdated", "user.2", []);
        let basic = amqp_properties(&PublishProperties::for_envelope(&envelope));
        assert!(basic.expiration().is_none());
        assert_eq!(*basic.delivery_mode(), Some(PERSISTENT));
    }
}
