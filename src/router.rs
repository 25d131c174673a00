//! Retry routing.
//!
//! For each delivery the router decodes the envelope, increments its attempt count, asks the
//! classifier for a verdict and invokes exactly one final action on the transport adapter:
//!
//! | Input | Action |
//! |---|---|
//! | undecodable payload | acknowledge (poison, never retried) |
//! | `Success` | acknowledge |
//! | `TerminalFailure` | dead-letter |
//! | `RetryableFailure`, attempts < max | redeliver after `backoff(attempts - 1)` |
//! | `RetryableFailure`, attempts >= max | dead-letter |
//!
//! Attempts therefore never exceed `max_attempts`, and every delivery of a given event id is
//! finalized exactly once per delivery.
//!
//! ```rust
//! use brokerlab::classifier::{Outcome, ScriptedClassifier};
//! use brokerlab::router::{Decision, DeadLetterReason, RetryRouter};
//! use std::time::Duration;
//!
//! let router = RetryRouter::builder()
//!     .max_attempts(3)
//!     .classifier(ScriptedClassifier::always(Outcome::RetryableFailure))
//!     .build()
//!     .unwrap();
//! assert_eq!(
//!     router.decide(Outcome::RetryableFailure, 1),
//!     Decision::RedeliveryScheduled { delay: Duration::from_millis(500) }
//! );
//! assert_eq!(
//!     router.decide(Outcome::RetryableFailure, 3),
//!     Decision::DeadLettered { reason: DeadLetterReason::Exhausted }
//! );
//! ```

use crate::backoff::{Backoff, BackoffStrategy};
use crate::classifier::{Classifier, Outcome};
use crate::envelope::{self, Envelope};
use crate::telemetry::{emit_best_effort, DeliveryEvent, NullSink, TelemetrySink};
use crate::transport::{Delivery, TransportAdapter, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default ceiling on processing attempts per event.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Why an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Retryable failures used up every attempt.
    Exhausted,
    /// The classifier reported a terminal failure.
    Terminal,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Exhausted => write!(f, "exhausted"),
            DeadLetterReason::Terminal => write!(f, "terminal"),
        }
    }
}

/// The final action taken for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The payload was not a valid envelope; acknowledged and dropped.
    Poisoned,
    Acknowledged,
    RedeliveryScheduled { delay: Duration },
    DeadLettered { reason: DeadLetterReason },
}

impl Decision {
    /// Stable label used in logs and telemetry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Poisoned => "poisoned",
            Decision::Acknowledged => "acknowledged",
            Decision::RedeliveryScheduled { .. } => "redelivery_scheduled",
            Decision::DeadLettered { .. } => "dead_lettered",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while building a router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(u32),
    /// No classifier was supplied.
    MissingClassifier,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => write!(f, "max_attempts must be > 0 (got {})", n),
            BuildError::MissingClassifier => write!(f, "a classifier is required"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Applies the retry policy to deliveries from any transport.
///
/// Cheap to share: wrap in an `Arc` and hand one to every worker.
pub struct RetryRouter<S = NullSink> {
    max_attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
    classifier: Arc<dyn Classifier>,
    sink: S,
}

impl<S: fmt::Debug> fmt::Debug for RetryRouter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRouter")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("classifier", &"<classifier>")
            .field("sink", &self.sink)
            .finish()
    }
}

impl RetryRouter<NullSink> {
    pub fn builder() -> RetryRouterBuilder<NullSink> {
        RetryRouterBuilder::new()
    }
}

impl<S> RetryRouter<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &dyn BackoffStrategy {
        self.backoff.as_ref()
    }

    /// The transition table, without side effects. `attempts` is the count after incrementing.
    pub fn decide(&self, outcome: Outcome, attempts: u32) -> Decision {
        match outcome {
            Outcome::Success => Decision::Acknowledged,
            Outcome::TerminalFailure => Decision::DeadLettered { reason: DeadLetterReason::Terminal },
            Outcome::RetryableFailure if attempts >= self.max_attempts => {
                Decision::DeadLettered { reason: DeadLetterReason::Exhausted }
            }
            Outcome::RetryableFailure => Decision::RedeliveryScheduled {
                delay: self.backoff.delay(attempts.saturating_sub(1)),
            },
        }
    }

    /// Route one delivery to its final action.
    ///
    /// Returns the decision once the adapter has carried it out. An adapter failure is logged
    /// and returned; the delivery is then left unfinalized and the transport will present it
    /// again.
    pub async fn route<A>(&self, adapter: &A, delivery: &A::Delivery) -> Result<Decision, TransportError>
    where
        A: TransportAdapter + ?Sized,
    {
        let transport = adapter.name();

        let mut envelope = match envelope::decode(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(poison) => {
                tracing::warn!(
                    transport,
                    len = poison.len(),
                    reason = %poison.reason(),
                    decision = Decision::Poisoned.as_str(),
                    "undecodable message"
                );
                adapter.acknowledge(delivery).await.map_err(|e| action_failed(transport, None, e))?;
                self.emit(DeliveryEvent {
                    transport,
                    id: None,
                    key: None,
                    attempts: 0,
                    decision: Decision::Poisoned,
                })
                .await;
                return Ok(Decision::Poisoned);
            }
        };

        let attempts = envelope.record_attempt(adapter.prior_deliveries(delivery));
        let outcome = self.classifier.classify(&envelope).await;
        let decision = self.decide(outcome, attempts);

        let result = match decision {
            Decision::Acknowledged | Decision::Poisoned => adapter.acknowledge(delivery).await,
            Decision::RedeliveryScheduled { delay } => {
                adapter.redeliver(delivery, &envelope, delay).await
            }
            Decision::DeadLettered { reason } => {
                adapter.dead_letter(delivery, &envelope, reason).await
            }
        };
        result.map_err(|e| action_failed(transport, Some(&envelope), e))?;

        log_decision(transport, &envelope, outcome, decision);
        self.emit(DeliveryEvent {
            transport,
            id: Some(envelope.id().to_string()),
            key: Some(envelope.key().to_string()),
            attempts,
            decision,
        })
        .await;
        Ok(decision)
    }

    async fn emit(&self, event: DeliveryEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn log_decision(transport: &str, envelope: &Envelope, outcome: Outcome, decision: Decision) {
    match decision {
        Decision::Acknowledged | Decision::Poisoned => tracing::info!(
            transport,
            id = envelope.id(),
            key = envelope.key(),
            attempts = envelope.attempts(),
            decision = decision.as_str(),
            "processed"
        ),
        Decision::RedeliveryScheduled { delay } => tracing::info!(
            transport,
            id = envelope.id(),
            key = envelope.key(),
            attempts = envelope.attempts(),
            %outcome,
            delay_ms = delay.as_millis() as u64,
            decision = decision.as_str(),
            "retrying"
        ),
        Decision::DeadLettered { reason } => tracing::warn!(
            transport,
            id = envelope.id(),
            key = envelope.key(),
            attempts = envelope.attempts(),
            %outcome,
            %reason,
            decision = decision.as_str(),
            "dead-lettered"
        ),
    }
}

fn action_failed(transport: &str, envelope: Option<&Envelope>, err: TransportError) -> TransportError {
    tracing::error!(
        transport,
        id = envelope.map(Envelope::id),
        key = envelope.map(Envelope::key),
        attempts = envelope.map(Envelope::attempts),
        error = %err,
        "final action failed; message left unacknowledged"
    );
    err
}

/// Builder for [`RetryRouter`].
pub struct RetryRouterBuilder<S> {
    max_attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
    classifier: Option<Arc<dyn Classifier>>,
    sink: S,
}

impl Default for RetryRouterBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryRouterBuilder<NullSink> {
    /// `max_attempts` 5, exponential backoff from 500ms capped at 20s, no telemetry.
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Arc::new(Backoff::default()),
            classifier: None,
            sink: NullSink,
        }
    }
}

impl<S> RetryRouterBuilder<S> {
    /// Ceiling on total processing attempts (first try included). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn classifier<C>(self, classifier: C) -> Self
    where
        C: Classifier + 'static,
    {
        self.shared_classifier(Arc::new(classifier))
    }

    /// Use a classifier that is also held elsewhere.
    pub fn shared_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Send a [`DeliveryEvent`] for every decision to `sink`.
    pub fn telemetry<T: TelemetrySink>(self, sink: T) -> RetryRouterBuilder<T> {
        RetryRouterBuilder {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            classifier: self.classifier,
            sink,
        }
    }

    pub fn build(self) -> Result<RetryRouter<S>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(self.max_attempts));
        }
        let classifier = self.classifier.ok_or(BuildError::MissingClassifier)?;
        Ok(RetryRouter {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            classifier,
            sink: self.sink,
        })
    }
}
