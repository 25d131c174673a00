//! Pieces shared by the broker binaries: pipeline arguments, logging setup, shutdown wiring
//! and the demo producer loop.
//!
//! Every argument also reads an environment variable, so the lab's `docker compose` style
//! configuration keeps working.

use crate::classifier::{InvalidFailureRate, RandomClassifier};
use crate::config::{ConfigError, PipelineConfig};
use crate::envelope::Envelope;
use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry and concurrency settings for a worker binary.
#[derive(Debug, Clone, clap::Args)]
pub struct PipelineArgs {
    /// Ceiling on processing attempts per event.
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,
    /// First redelivery delay, in milliseconds.
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,
    /// Largest redelivery delay, in milliseconds.
    #[arg(long, env = "BACKOFF_CAP_MS", default_value_t = 20_000)]
    pub backoff_cap_ms: u64,
    /// Concurrent workers in this process.
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,
    /// Fraction of attempts the stand-in classifier fails.
    #[arg(long, env = "FAILURE_RATE", default_value_t = RandomClassifier::DEFAULT_FAILURE_RATE)]
    pub failure_rate: f64,
}

impl PipelineArgs {
    pub fn config(&self) -> Result<PipelineConfig, ConfigError> {
        PipelineConfig::builder()
            .max_attempts(self.max_attempts)
            .backoff_base(Duration::from_millis(self.backoff_base_ms))
            .backoff_cap(Duration::from_millis(self.backoff_cap_ms))
            .worker_count(self.workers)
            .build()
    }

    pub fn classifier(&self) -> Result<RandomClassifier, InvalidFailureRate> {
        RandomClassifier::new(self.failure_rate)
    }
}

/// Pacing for a producer binary.
#[derive(Debug, Clone, clap::Args)]
pub struct ProducerArgs {
    /// Delay between events, in milliseconds.
    #[arg(long, env = "PRODUCE_INTERVAL_MS", default_value_t = 700)]
    pub interval_ms: u64,
    /// Stop after this many events. Runs until interrupted when unset.
    #[arg(long, env = "PRODUCE_COUNT")]
    pub count: Option<u64>,
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing in-flight messages");
        }
        token.cancel();
    });
}

/// The lab's demo event: `UserUpdated` for one of three users, stamped with the current time.
///
/// `separator` joins the user prefix and number (`user-1` for Kafka and Pub/Sub keys, `user.1`
/// for AMQP routing-friendly keys).
pub fn demo_event(sequence: u64, separator: char) -> Envelope {
    let key = format!("user{}{}", separator, sequence % 3 + 1);
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    Envelope::new("UserUpdated", key, [("i".to_string(), stamp)])
}

/// Publish a demo event every `interval_ms` until `count` is reached or `shutdown` fires.
pub async fn produce<F, Fut, E>(
    args: &ProducerArgs,
    separator: char,
    shutdown: CancellationToken,
    mut publish: F,
) -> Result<u64, E>
where
    F: FnMut(Envelope) -> Fut,
    Fut: Future<Output = Result<Envelope, E>>,
    E: fmt::Display,
{
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0;
    while args.count.map_or(true, |limit| sent < limit) {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let event = publish(demo_event(sent, separator)).await.map_err(|err| {
            tracing::error!(error = %err, "publish failed");
            err
        })?;
        tracing::info!(id = event.id(), key = event.key(), "published");
        sent += 1;
    }
    Ok(sent)
}
