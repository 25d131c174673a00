//! Delivery telemetry.
//!
//! Every routing decision is described by a [`DeliveryEvent`] and handed to a sink. Sinks are
//! plain `tower::Service`s, so anything that can consume an event (a log, a buffer, a metrics
//! bridge) plugs in the same way. Emission is best-effort: sink errors never affect delivery.

use crate::router::Decision;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower_service::Service;

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    /// Transport that carried the message.
    pub transport: &'static str,
    /// Event id; `None` when the message could not be decoded.
    pub id: Option<String>,
    /// Routing key; `None` when the message could not be decoded.
    pub key: Option<String>,
    /// Attempt count after this classification (0 for poison messages).
    pub attempts: u32,
    pub decision: Decision,
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(transport={}, id={}, key={}, attempts={})",
            self.decision,
            self.transport,
            self.id.as_deref().unwrap_or("-"),
            self.key.as_deref().unwrap_or("-"),
            self.attempts
        )
    }
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A sink that consumes delivery events.
pub trait TelemetrySink:
    Service<DeliveryEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Wait for the sink to be ready, hand it the event, and ignore any failure.
pub async fn emit_best_effort<S>(sink: S, event: DeliveryEvent)
where
    S: Service<DeliveryEvent, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DeliveryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DeliveryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Forwards events to `tracing` at debug level under the `brokerlab::telemetry` target.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DeliveryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        tracing::debug!(target: "brokerlab::telemetry", event = %event, "delivery_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory. Clones share the buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DeliveryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Decisions only, in emission order.
    pub fn decisions(&self) -> Vec<Decision> {
        self.events().into_iter().map(|e| e.decision).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DeliveryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            events.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
