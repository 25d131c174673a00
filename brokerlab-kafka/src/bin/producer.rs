use anyhow::Context;
use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, produce, ProducerArgs};
use brokerlab_kafka::{create_producer, KafkaConfig, KafkaPublisher};
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Publish demo `UserUpdated` events to Kafka.
#[derive(Debug, Parser)]
#[command(name = "kafka-producer", version)]
struct Args {
    #[command(flatten)]
    kafka: KafkaConfig,
    #[command(flatten)]
    producer: ProducerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let producer = create_producer(&args.kafka).context("creating producer")?;
    let publisher = KafkaPublisher::new(producer, &args.kafka.topic);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    tracing::info!(topic = %args.kafka.topic, "kafka producer started");
    let sent = produce(&args.producer, '-', shutdown, |event| {
        let publisher = publisher.clone();
        async move { publisher.publish(&event).await.map(|()| event) }
    })
    .await?;
    tracing::info!(sent, "kafka producer stopped");
    Ok(())
}
