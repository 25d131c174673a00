//! Suspension used by adapters that must wait out a backoff themselves.
//!
//! The offset-commit adapter has no broker-side delay primitive, so it suspends the calling
//! worker before handing control back. Injecting the sleeper keeps that wait out of tests.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Suspends the current task for a duration.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::ready(()))
    }
}

/// Returns immediately and remembers every requested duration. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far, oldest first.
    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Sum of all requested durations.
    pub fn total(&self) -> Duration {
        self.requested().iter().sum()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(duration);
        }
        Box::pin(futures::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracking_sleeper_records_in_order() {
        let sleeper = TrackingSleeper::new();
        let shared = sleeper.clone();
        sleeper.sleep(Duration::from_millis(500)).await;
        shared.sleep(Duration::from_secs(1)).await;
        assert_eq!(sleeper.requested(), vec![Duration::from_millis(500), Duration::from_secs(1)]);
        assert_eq!(shared.total(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_on_timer() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(4)).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn instant_sleeper_does_not_advance_time() {
        let start = tokio::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(60)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
