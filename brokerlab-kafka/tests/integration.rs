#![cfg(feature = "client")]

use brokerlab::classifier::{Outcome, ScriptedClassifier};
use brokerlab::router::{Decision, RetryRouter};
use brokerlab::sleeper::InstantSleeper;
use brokerlab::telemetry::MemorySink;
use brokerlab::transport::OffsetCommitAdapter;
use brokerlab::worker::WorkerPool;
use brokerlab::Envelope;
use brokerlab_kafka::{
    create_consumer, create_producer, KafkaConfig, KafkaLog, KafkaPublisher, KafkaSource,
};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Requires Kafka running. If BROKERLAB_TEST_KAFKA_BROKERS is unset, the test skips.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rewinds_until_success_then_commits() {
    let brokers = match std::env::var("BROKERLAB_TEST_KAFKA_BROKERS") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set BROKERLAB_TEST_KAFKA_BROKERS (e.g. 127.0.0.1:9092)");
            return;
        }
    };

    let unique = Uuid::new_v4().to_string();
    let config = KafkaConfig {
        brokers: brokers.clone(),
        topic: format!("events.test.{unique}"),
        dlq_topic: format!("events.test.{unique}.dlq"),
        group_id: format!("brokerlab-test-{unique}"),
    };

    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .create()
        .expect("failed to create Kafka AdminClient");
    let topics = [
        NewTopic::new(&config.topic, 1, TopicReplication::Fixed(1)),
        NewTopic::new(&config.dlq_topic, 1, TopicReplication::Fixed(1)),
    ];
    admin.create_topics(&topics, &AdminOptions::new()).await.expect("failed to create topics");

    let producer = create_producer(&config).expect("failed to create producer");
    let event = Envelope::new("UserUpdated", "user-1", []);
    KafkaPublisher::new(producer.clone(), &config.topic)
        .publish(&event)
        .await
        .expect("failed to publish");

    let sink = MemorySink::new();
    let classifier =
        ScriptedClassifier::new([Outcome::RetryableFailure, Outcome::RetryableFailure]);
    let router = RetryRouter::builder()
        .classifier(classifier)
        .telemetry(sink.clone())
        .build()
        .unwrap();
    let adapter = OffsetCommitAdapter::new(KafkaLog::new(producer, &config.dlq_topic))
        .with_sleeper(InstantSleeper);

    let shutdown = CancellationToken::new();
    let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), shutdown.clone());
    pool.spawn(KafkaSource::new(create_consumer(&config).expect("failed to create consumer")));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while sink.len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    shutdown.cancel();
    pool.join().await.expect("worker failed");

    let events = sink.events();
    assert_eq!(events.iter().map(|e| e.attempts).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(events[2].decision, Decision::Acknowledged);
    assert!(events.iter().all(|e| e.id.as_deref() == Some(event.id())));
}
