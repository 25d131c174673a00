use anyhow::Context;
use brokerlab::cli::{cancel_on_ctrl_c, init_tracing, produce, ProducerArgs};
use brokerlab_rabbitmq::{connect, RabbitChannel, RabbitConfig};
use clap::Parser;
use lapin::options::ExchangeDeclareOptions;
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tokio_util::sync::CancellationToken;

/// Publish demo `UserUpdated` events to the RabbitMQ exchange.
#[derive(Debug, Parser)]
#[command(name = "rabbitmq-producer", version)]
struct Args {
    #[command(flatten)]
    rabbit: RabbitConfig,
    #[command(flatten)]
    producer: ProducerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let topology = args.rabbit.topology();
    let (connection, channel) = connect(&args.rabbit).await.context("connecting to rabbitmq")?;
    channel
        .exchange_declare(
            topology.exchange(),
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..ExchangeDeclareOptions::default() },
            FieldTable::default(),
        )
        .await
        .context("declaring exchange")?;
    let publisher = RabbitChannel::new(channel);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    tracing::info!(exchange = topology.exchange(), "rabbitmq producer started");
    let sent = produce(&args.producer, '.', shutdown, |event| {
        let publisher = publisher.clone();
        let topology = topology.clone();
        async move { publisher.publish_envelope(&topology, &event).await.map(|()| event) }
    })
    .await?;
    connection.close(200, "producer stopped").await.context("closing connection")?;
    tracing::info!(sent, "rabbitmq producer stopped");
    Ok(())
}
