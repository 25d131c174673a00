#![cfg(feature = "client")]

use brokerlab::classifier::{Outcome, ScriptedClassifier};
use brokerlab::router::{Decision, RetryRouter};
use brokerlab::telemetry::MemorySink;
use brokerlab::transport::{AckNackAdapter, DeadLetterMode};
use brokerlab::worker::WorkerPool;
use brokerlab::Envelope;
use brokerlab_pubsub::{
    connect, ensure_subscription, ensure_topic, PubSubConfig, PubSubPublisher, PubSubSource,
    PubSubSubscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Requires the Pub/Sub emulator. If PUBSUB_EMULATOR_HOST is unset, the test skips.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nacks_until_success_then_acks() {
    if std::env::var_os("PUBSUB_EMULATOR_HOST").is_none() {
        eprintln!("skipping: set PUBSUB_EMULATOR_HOST (e.g. localhost:8085)");
        return;
    }

    let unique = Uuid::new_v4().simple().to_string();
    let config = PubSubConfig {
        project: "brokerlab-test".into(),
        topic: format!("events-{unique}"),
        subscription: format!("worker-{unique}"),
        dlq_topic: format!("events-{unique}-dlq"),
        ..PubSubConfig::default()
    };
    let client = connect(&config).await.expect("failed to connect to emulator");
    let subscription =
        ensure_subscription(&client, &config, None).await.expect("failed to provision");
    let dlq = ensure_topic(&client, &config.dlq_topic).await.expect("failed to create dlq topic");

    let event = Envelope::new("UserUpdated", "user-1", []);
    let topic = ensure_topic(&client, &config.topic).await.expect("failed to create topic");
    PubSubPublisher::new(&topic).publish(&event).await.expect("failed to publish");

    let sink = MemorySink::new();
    let classifier =
        ScriptedClassifier::new([Outcome::RetryableFailure, Outcome::RetryableFailure]);
    let router = RetryRouter::builder()
        .classifier(classifier)
        .telemetry(sink.clone())
        .build()
        .unwrap();
    let subscription_client = PubSubSubscription::new(Some(PubSubPublisher::new(&dlq)));
    let adapter = AckNackAdapter::new(subscription_client, DeadLetterMode::Topic);

    let shutdown = CancellationToken::new();
    let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), shutdown.clone());
    pool.spawn(PubSubSource::open(&subscription, 10).await.expect("failed to subscribe"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while sink.len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    shutdown.cancel();
    pool.join().await.expect("worker failed");

    let events = sink.events();
    assert_eq!(events.iter().map(|e| e.attempts).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(events[2].decision, Decision::Acknowledged);
}
