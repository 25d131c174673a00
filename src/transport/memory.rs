//! In-process transports, one per broker model.
//!
//! - [`MemoryLog`]: partitioned log with a consumer group's fetch and committed positions.
//! - [`MemorySubscription`]: subscription with an outstanding set and immediate nack redelivery,
//!   optionally with a dead-letter policy.
//! - [`MemoryExchange`]: topic exchange feeding a main queue, timed delay queues that dead-letter
//!   back to it, and a terminal dead-letter queue.
//!
//! Each one implements the client trait of the matching adapter strategy and hands out
//! [`MessageSource`](super::MessageSource)s. Sources end once the transport is closed and no
//! message can appear again.

mod exchange;
mod log;
mod subscription;

pub use exchange::{ExchangeMessage, MemoryExchange, QueueConsumer, QueueDelivery};
pub use log::{LogConsumer, LogDelivery, LogRecord, MemoryLog};
pub use subscription::{MemorySubscription, SubscriptionMessage, Subscriber};

use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
