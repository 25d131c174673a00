//! Worker loops.
//!
//! A [`WorkerPool`] runs one task per [`MessageSource`], all sharing a router and an adapter.
//! Each task pulls a delivery, routes it, and repeats until the source ends, a fetch fails, or
//! the pool's [`CancellationToken`] fires. An action error that [`TransportError::is_fetch`]
//! also ends the task: the adapter could not hand the message back, and the error says so. Cancellation is only observed between deliveries: a
//! delivery that has been fetched is always routed to completion, so shutdown never strands a
//! half-finalized message.

use crate::router::{Decision, RetryRouter};
use crate::telemetry::TelemetrySink;
use crate::transport::{MessageSource, TransportAdapter, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Why a worker stopped abnormally.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker stopped: {0}")]
    Transport(#[from] TransportError),
    #[error("worker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Point-in-time counters across every worker of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub poisoned: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// Deliveries whose final action failed and were left unacknowledged.
    pub action_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    poisoned: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    action_failures: AtomicU64,
}

impl Counters {
    fn record(&self, decision: Decision) {
        let counter = match decision {
            Decision::Acknowledged => &self.acknowledged,
            Decision::Poisoned => &self.poisoned,
            Decision::RedeliveryScheduled { .. } => &self.redelivered,
            Decision::DeadLettered { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
        }
    }
}

/// A set of worker tasks sharing one router and one adapter.
pub struct WorkerPool<A, S> {
    router: Arc<RetryRouter<S>>,
    adapter: Arc<A>,
    shutdown: CancellationToken,
    tasks: JoinSet<Result<(), TransportError>>,
    counters: Arc<Counters>,
}

impl<A, S> WorkerPool<A, S>
where
    A: TransportAdapter + 'static,
    A::Delivery: 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    pub fn new(router: Arc<RetryRouter<S>>, adapter: Arc<A>, shutdown: CancellationToken) -> Self {
        Self {
            router,
            adapter,
            shutdown,
            tasks: JoinSet::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start a worker consuming `source`.
    pub fn spawn<M>(&mut self, source: M)
    where
        M: MessageSource<Delivery = A::Delivery> + 'static,
    {
        let worker = self.tasks.len();
        let router = self.router.clone();
        let adapter = self.adapter.clone();
        let shutdown = self.shutdown.clone();
        let counters = self.counters.clone();
        self.tasks.spawn(async move {
            run(worker, source, router, adapter, shutdown, counters).await
        });
    }

    pub fn spawn_all<M>(&mut self, sources: impl IntoIterator<Item = M>)
    where
        M: MessageSource<Delivery = A::Delivery> + 'static,
    {
        for source in sources {
            self.spawn(source);
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Ask every worker to stop after its current delivery.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to stop. Returns the first failure, after all workers are done.
    pub async fn join(mut self) -> Result<WorkerStats, WorkerError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(WorkerError::from(e)),
                Err(e) => Some(WorkerError::from(e)),
            };
            if let Some(err) = failure {
                tracing::error!(error = %err, "worker exited with error");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(self.counters.snapshot()),
        }
    }
}

async fn run<A, S, M>(
    worker: usize,
    mut source: M,
    router: Arc<RetryRouter<S>>,
    adapter: Arc<A>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) -> Result<(), TransportError>
where
    A: TransportAdapter,
    M: MessageSource<Delivery = A::Delivery>,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    let transport = adapter.name();
    tracing::info!(worker, transport, "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(worker, transport, "worker stopping");
                return Ok(());
            }
            next = source.next() => next,
        };
        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tracing::info!(worker, transport, "source exhausted");
                return Ok(());
            }
            Err(err) => {
                tracing::error!(worker, transport, error = %err, "fetch failed");
                return Err(err);
            }
        };
        counters.received.fetch_add(1, Ordering::Relaxed);
        match router.route(adapter.as_ref(), &delivery).await {
            Ok(decision) => counters.record(decision),
            // The adapter could not put the message back; consuming on would skip it.
            Err(err) if err.is_fetch() => {
                counters.action_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker, transport, error = %err, "worker stopping on failed action");
                return Err(err);
            }
            // Already logged by the router; the transport presents the message again.
            Err(_) => {
                counters.action_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
