#![allow(dead_code)]

use brokerlab::classifier::{Classifier, Outcome, ScriptedClassifier};
use brokerlab::envelope::{decode, Envelope};
use brokerlab::router::RetryRouter;
use brokerlab::telemetry::MemorySink;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Install a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn user_updated(key: &str) -> Envelope {
    let payload = BTreeMap::from([("i".to_string(), "2024-01-01T00:00:00Z".to_string())]);
    Envelope::new("UserUpdated", key, payload)
}

pub fn router<C>(classifier: C, max_attempts: u32) -> (Arc<RetryRouter<MemorySink>>, MemorySink)
where
    C: Classifier + 'static,
{
    let sink = MemorySink::new();
    let router = RetryRouter::builder()
        .max_attempts(max_attempts)
        .classifier(classifier)
        .telemetry(sink.clone())
        .build()
        .expect("valid router");
    (Arc::new(router), sink)
}

pub fn always(outcome: Outcome) -> ScriptedClassifier {
    ScriptedClassifier::always(outcome)
}

/// The delays the default backoff produces for four retries.
pub fn default_delays() -> Vec<Duration> {
    vec![
        Duration::from_millis(500),
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ]
}

pub fn attempts_of(payload: &[u8]) -> u32 {
    decode(payload).expect("dead letter is a valid envelope").attempts()
}
