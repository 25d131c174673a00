use anyhow::Context;
use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, PipelineArgs};
use brokerlab::telemetry::LogSink;
use brokerlab::transport::{AckNackAdapter, DeadLetterMode};
use brokerlab::worker::WorkerPool;
use brokerlab_pubsub::{
    connect, ensure_subscription, ensure_topic, PubSubConfig, PubSubPublisher, PubSubSource,
    PubSubSubscription,
};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pull events from a Pub/Sub subscription with bounded retries.
#[derive(Debug, Parser)]
#[command(name = "pubsub-worker", version)]
struct Args {
    #[command(flatten)]
    pubsub: PubSubConfig,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.pipeline.config()?;
    let router = config
        .router_builder()
        .classifier(args.pipeline.classifier()?)
        .telemetry(LogSink)
        .build()?;

    let mode = args.pubsub.dead_letter_mode();
    let policy_attempts = args.pubsub.policy_attempts(config.max_attempts())?;
    let client = connect(&args.pubsub).await?;
    let subscription = ensure_subscription(&client, &args.pubsub, policy_attempts).await?;
    let mut dead_letters = match mode {
        DeadLetterMode::Topic | DeadLetterMode::BrokerPolicy => {
            let topic = ensure_topic(&client, &args.pubsub.dlq_topic).await?;
            Some(PubSubPublisher::new(&topic))
        }
        DeadLetterMode::Drop => None,
    };
    let adapter = AckNackAdapter::new(PubSubSubscription::new(dead_letters.clone()), mode)
        .with_advisory_delay(args.pubsub.advisory_delay());

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), shutdown);
    for _ in 0..config.worker_count() {
        let source = PubSubSource::open(&subscription, args.pubsub.max_outstanding)
            .await
            .context("opening streaming pull")?;
        pool.spawn(source);
    }

    tracing::info!(
        subscription = %args.pubsub.subscription,
        dead_letter = %mode,
        workers = config.worker_count(),
        "pubsub worker consuming"
    );
    let stats = pool.join().await?;
    if let Some(publisher) = dead_letters.as_mut() {
        publisher.shutdown().await;
    }
    tracing::info!(?stats, "pubsub worker stopped");
    Ok(())
}
