#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # brokerlab
//!
//! At-least-once event delivery with bounded retries and dead-lettering, over three broker
//! models: offset-commit logs (Kafka), ack/nack subscriptions (Pub/Sub) and exchanges with
//! delay queues (RabbitMQ).
//!
//! ## Pieces
//!
//! - [`envelope`]: the JSON event envelope every transport carries.
//! - [`backoff`]: capped exponential redelivery delays.
//! - [`classifier`]: the verdict for one processing attempt.
//! - [`transport`]: the capabilities a broker must offer, the three adapter strategies, and
//!   in-memory transports for each broker model.
//! - [`router`]: the retry state machine that picks exactly one final action per delivery.
//! - [`worker`]: worker loops with cooperative shutdown.
//! - [`telemetry`]: delivery events and sinks.
//! - [`config`]: validated pipeline settings.
//! - `cli` (feature `cli`): argument parsing and setup shared by the broker binaries.
//!
//! ## Quick Start
//!
//! ```rust
//! use brokerlab::prelude::*;
//! use brokerlab::transport::memory::MemorySubscription;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let subscription = MemorySubscription::new();
//! subscription.publish_envelope(&Envelope::new("UserUpdated", "user-1", []));
//! subscription.close();
//!
//! let config = PipelineConfig::default();
//! let router = config
//!     .router_builder()
//!     .classifier(ScriptedClassifier::always(Outcome::Success))
//!     .build()
//!     .unwrap();
//! let adapter = AckNackAdapter::new(subscription.clone(), DeadLetterMode::Topic);
//!
//! let mut pool = WorkerPool::new(Arc::new(router), Arc::new(adapter), CancellationToken::new());
//! pool.spawn(subscription.subscriber());
//! let stats = pool.join().await.unwrap();
//! assert_eq!(stats.acknowledged, 1);
//! # });
//! ```

pub mod backoff;
pub mod classifier;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod envelope;
pub mod prelude;
pub mod router;
pub mod sleeper;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use backoff::{Backoff, BackoffError, BackoffStrategy};
pub use classifier::{Classifier, FnClassifier, Outcome, RandomClassifier, ScriptedClassifier};
pub use config::{ConfigError, PipelineConfig, PipelineConfigBuilder};
pub use envelope::{Envelope, PoisonMessage};
pub use router::{BuildError, DeadLetterReason, Decision, RetryRouter, RetryRouterBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{DeliveryEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use transport::{
    AckNackAdapter, DeadLetterMode, Delivery, MessageSource, OffsetCommitAdapter,
    RequeueAdapter, RequeueTopology, TransportAdapter, TransportError,
};
pub use worker::{WorkerError, WorkerPool, WorkerStats};
