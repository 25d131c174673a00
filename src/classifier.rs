//! Outcome classification for a single processing attempt.
//!
//! The classifier stands in for business processing. It is injected into the router so a real
//! handler can replace the lab's stochastic one without touching retry logic.

use crate::envelope::Envelope;
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// Verdict for one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// Transient failure; eligible for redelivery while attempts remain.
    RetryableFailure,
    /// Business-fatal failure; dead-lettered regardless of attempts.
    TerminalFailure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::RetryableFailure => write!(f, "retryable_failure"),
            Outcome::TerminalFailure => write!(f, "terminal_failure"),
        }
    }
}

/// Decides whether an attempt succeeded. Implementations must not have side effects beyond
/// computing the verdict.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, envelope: &Envelope) -> Outcome;
}

/// Fails a fixed fraction of attempts at random with a retryable failure.
#[derive(Debug, Clone, Copy)]
pub struct RandomClassifier {
    failure_rate: f64,
}

/// Invalid failure rate passed to [`RandomClassifier::new`].
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("failure rate must be within [0, 1] (got {0})")]
pub struct InvalidFailureRate(pub f64);

impl RandomClassifier {
    /// Three failures in ten, the lab default.
    pub const DEFAULT_FAILURE_RATE: f64 = 0.3;

    pub fn new(failure_rate: f64) -> Result<Self, InvalidFailureRate> {
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(InvalidFailureRate(failure_rate));
        }
        Ok(Self { failure_rate })
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }
}

impl Default for RandomClassifier {
    fn default() -> Self {
        Self { failure_rate: Self::DEFAULT_FAILURE_RATE }
    }
}

#[async_trait]
impl Classifier for RandomClassifier {
    async fn classify(&self, _envelope: &Envelope) -> Outcome {
        if rand::rng().random_bool(self.failure_rate) {
            Outcome::RetryableFailure
        } else {
            Outcome::Success
        }
    }
}

/// Replays a scripted sequence of outcomes, then repeats `fallback` forever.
#[derive(Debug)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
}

impl ScriptedClassifier {
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self { script: Mutex::new(outcomes.into_iter().collect()), fallback: Outcome::Success }
    }

    /// Outcome returned once the script runs out.
    pub fn then(mut self, fallback: Outcome) -> Self {
        self.fallback = fallback;
        self
    }

    /// A classifier that always answers `outcome`.
    pub fn always(outcome: Outcome) -> Self {
        Self::new([]).then(outcome)
    }

    /// Outcomes still queued.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _envelope: &Envelope) -> Outcome {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or(self.fallback)
    }
}

/// Adapts a plain function into a classifier.
pub struct FnClassifier<F> {
    f: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&Envelope) -> Outcome + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").field("f", &"<fn>").finish()
    }
}

#[async_trait]
impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&Envelope) -> Outcome + Send + Sync,
{
    async fn classify(&self, envelope: &Envelope) -> Outcome {
        (self.f)(envelope)
    }
}
