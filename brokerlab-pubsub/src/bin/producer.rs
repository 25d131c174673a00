use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, produce, ProducerArgs};
use brokerlab_pubsub::{connect, ensure_topic, PubSubConfig, PubSubPublisher};
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Publish demo `UserUpdated` events to Pub/Sub.
#[derive(Debug, Parser)]
#[command(name = "pubsub-producer", version)]
struct Args {
    #[command(flatten)]
    pubsub: PubSubConfig,
    #[command(flatten)]
    producer: ProducerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let client = connect(&args.pubsub).await?;
    let topic = ensure_topic(&client, &args.pubsub.topic).await?;
    let mut publisher = PubSubPublisher::new(&topic);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    tracing::info!(topic = %args.pubsub.topic, "pubsub producer started");
    let sent = produce(&args.producer, '-', shutdown, |event| {
        let publisher = publisher.clone();
        async move { publisher.publish(&event).await.map(|()| event) }
    })
    .await;
    publisher.shutdown().await;
    let sent = sent?;
    tracing::info!(sent, "pubsub producer stopped");
    Ok(())
}
