use anyhow::Context;
use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, PipelineArgs};
use brokerlab::telemetry::LogSink;
use brokerlab::transport::OffsetCommitAdapter;
use brokerlab::worker::WorkerPool;
use brokerlab_kafka::{create_consumer, create_producer, KafkaConfig, KafkaLog, KafkaSource};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Consume events from Kafka with bounded retries and a dead-letter topic.
#[derive(Debug, Parser)]
#[command(name = "kafka-worker", version)]
struct Args {
    #[command(flatten)]
    kafka: KafkaConfig,
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

    let producer = create_producer(&args.kafka).context("creating dead-letter producer")?;
    let adapter = OffsetCommitAdapter::new(KafkaLog::new(producer, &args.kafka.dlq_topic));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), shutdown);
    for _ in 0..config.worker_count() {
        let consumer = create_consumer(&args.kafka).context("creating consumer")?;
        pool.spawn(KafkaSource::new(consumer));
    }

    tracing::info!(
        topic = %args.kafka.topic,
        group = %args.kafka.group_id,
        workers = config.worker_count(),
        "kafka worker consuming"
    );
    let stats = pool.join().await?;
    tracing::info!(?stats, "kafka worker stopped");
    Ok(())
}
