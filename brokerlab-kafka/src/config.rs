use std::time::Duration;

/// Connection and naming settings for the Kafka transport.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct KafkaConfig {
    /// Bootstrap servers, comma separated.
    #[arg(long = "kafka-broker", env = "KAFKA_BROKER", default_value = "localhost:9092")]
    pub brokers: String,
    /// Topic consumed by workers and written by producers.
    #[arg(long = "kafka-topic", env = "KAFKA_TOPIC", default_value = "events")]
    pub topic: String,
    /// Dead-letter topic.
    #[arg(long = "kafka-dlq-topic", env = "KAFKA_DLQ_TOPIC", default_value = "events.dlq")]
    pub dlq_topic: String,
    /// Consumer group shared by every worker.
    #[arg(long = "kafka-group", env = "KAFKA_GROUP", default_value = "worker-group")]
    pub group_id: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            topic: "events".into(),
            dlq_topic: "events.dlq".into(),
            group_id: "worker-group".into(),
        }
    }
}

/// How long a produce may wait for broker acknowledgement.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

impl KafkaConfig {
    /// librdkafka settings for a worker consumer.
    ///
    /// Offsets are committed explicitly after the final action, never automatically, and the
    /// group starts from the earliest retained record.
    pub fn consumer_settings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bootstrap.servers", self.brokers.clone()),
            ("group.id", self.group_id.clone()),
            ("enable.auto.commit", "false".into()),
            ("enable.auto.offset.store", "false".into()),
            ("auto.offset.reset", "earliest".into()),
            ("enable.partition.eof", "false".into()),
        ]
    }

    /// librdkafka settings for the event and dead-letter producers.
    pub fn producer_settings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bootstrap.servers", self.brokers.clone()),
            ("message.timeout.ms", MESSAGE_TIMEOUT.as_millis().to_string()),
            ("partitioner", "murmur2_random".into()),
        ]
    }
}
