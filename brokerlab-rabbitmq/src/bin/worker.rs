use anyhow::Context;
use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, PipelineArgs};
use brokerlab::telemetry::LogSink;
use brokerlab::transport::RequeueAdapter;
use brokerlab::worker::WorkerPool;
use brokerlab_rabbitmq::{connect, declare_topology, RabbitChannel, RabbitConfig, RabbitSource};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Consume events from RabbitMQ with delay-queue retries and a dead-letter queue.
#[derive(Debug, Parser)]
#[command(name = "rabbitmq-worker", version)]
struct Args {
    #[command(flatten)]
    rabbit: RabbitConfig,
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

    let topology = args.rabbit.topology();
    let (connection, channel) = connect(&args.rabbit).await.context("connecting to rabbitmq")?;
    declare_topology(&channel, &topology, &config.retry_schedule())
        .await
        .context("declaring topology")?;
    let adapter = RequeueAdapter::new(RabbitChannel::new(channel.clone()), topology.clone());

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), shutdown);
    for n in 0..config.worker_count() {
        let tag = format!("brokerlab-worker-{n}");
        let source = RabbitSource::open(&channel, topology.queue(), &tag)
            .await
            .context("starting consumer")?;
        pool.spawn(source);
    }

    tracing::info!(
        queue = topology.queue(),
        prefetch = args.rabbit.prefetch,
        workers = config.worker_count(),
        "rabbitmq worker consuming"
    );
    let stats = pool.join().await?;
    connection.close(200, "worker stopped").await.context("closing connection")?;
    tracing::info!(?stats, "rabbitmq worker stopped");
    Ok(())
}
