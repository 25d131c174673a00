mod support;

use brokerlab::backoff::Backoff;
use brokerlab::classifier::{Outcome, ScriptedClassifier};
use brokerlab::envelope::decode;
use brokerlab::router::{DeadLetterReason, Decision};
use brokerlab::transport::memory::MemoryExchange;
use brokerlab::transport::{PublishProperties, RequeueAdapter, RequeueChannel, RequeueTopology};
use brokerlab::worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn topology() -> RequeueTopology {
    RequeueTopology::new("events.x", "worker.q", "user.updated")
}

fn exchange(max_attempts: u32) -> MemoryExchange {
    MemoryExchange::new(topology(), &Backoff::default().schedule(max_attempts))
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_cycles_through_delay_queues() {
    init_tracing();
    let x = exchange(5);
    let event = user_updated("user.1");
    x.publish_envelope(&event).unwrap();
    x.close();

    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, sink) = router(always(Outcome::RetryableFailure), 5);
    let mut pool = WorkerPool::new(router, Arc::new(adapter), CancellationToken::new());
    pool.spawn(x.consumer());

    let start = Instant::now();
    pool.join().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(7_500));

    let events = sink.events();
    assert_eq!(events.iter().map(|e| e.attempts).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events[4].decision,
        Decision::DeadLettered { reason: DeadLetterReason::Exhausted }
    );

    let dead = x.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].properties.message_id, event.id());
    assert_eq!(dead[0].properties.key, "user.1");
    assert_eq!(dead[0].properties.expiration, None);
    let copy = decode(&dead[0].payload).unwrap();
    assert_eq!(copy.attempts(), 5);
    assert_eq!(copy.key(), "user.1");
    assert_eq!(x.unacked(), 0);
}

#[tokio::test(start_paused = true)]
async fn retried_copy_goes_behind_newer_messages() {
    let x = exchange(5);
    let first = user_updated("user.1");
    let second = user_updated("user.1");
    x.publish_envelope(&first).unwrap();
    x.publish_envelope(&second).unwrap();
    x.close();

    let classifier = ScriptedClassifier::new([Outcome::RetryableFailure]);
    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, sink) = router(classifier, 5);
    let mut pool = WorkerPool::new(router, Arc::new(adapter), CancellationToken::new());
    pool.spawn(x.consumer());
    pool.join().await.unwrap();

    let order: Vec<String> = sink.events().into_iter().filter_map(|e| e.id).collect();
    assert_eq!(order, vec![first.id(), second.id(), first.id()]);
}

#[tokio::test(start_paused = true)]
async fn poison_message_is_acked_without_dead_letter() {
    let x = exchange(5);
    let props = PublishProperties::for_envelope(&user_updated("user.1"));
    x.publish(&topology().main_route(), &props, b"{not-json".to_vec()).await.unwrap();
    x.close();

    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, sink) = router(always(Outcome::RetryableFailure), 5);
    let mut pool = WorkerPool::new(router, Arc::new(adapter), CancellationToken::new());
    pool.spawn(x.consumer());
    pool.join().await.unwrap();

    assert_eq!(sink.decisions(), vec![Decision::Poisoned]);
    assert!(x.dead_letters().is_empty());
    assert_eq!((x.unacked(), x.delayed()), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn single_attempt_ceiling_skips_delay_queues() {
    let x = exchange(1);
    x.publish_envelope(&user_updated("user.2")).unwrap();
    x.close();

    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, _sink) = router(always(Outcome::RetryableFailure), 1);
    let mut pool = WorkerPool::new(router, Arc::new(adapter), CancellationToken::new());
    pool.spawn(x.consumer());

    let start = Instant::now();
    pool.join().await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(attempts_of(&x.dead_letters()[0].payload), 1);
}

#[tokio::test(start_paused = true)]
async fn success_acks_once() {
    let x = exchange(5);
    x.publish_envelope(&user_updated("user.3")).unwrap();
    x.close();

    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, sink) = router(always(Outcome::Success), 5);
    let mut pool = WorkerPool::new(router, Arc::new(adapter), CancellationToken::new());
    pool.spawn(x.consumer());
    let stats = pool.join().await.unwrap();

    assert_eq!(stats.acknowledged, 1);
    assert_eq!(sink.decisions(), vec![Decision::Acknowledged]);
    assert_eq!(x.unacked(), 0);
    assert!(x.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn undeclared_delay_leaves_original_unacked() {
    // Exchange declared for a ceiling of 2, router configured for 5: the 1s delay queue is
    // missing, so the second retry cannot be published.
    let x = exchange(2);
    x.publish_envelope(&user_updated("user.1")).unwrap();

    let adapter = RequeueAdapter::new(x.clone(), topology());
    let (router, sink) = router(always(Outcome::RetryableFailure), 5);
    let token = CancellationToken::new();
    let mut pool = WorkerPool::new(router, Arc::new(adapter), token.clone());
    pool.spawn(x.consumer());

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    let stats = pool.join().await.unwrap();

    assert_eq!(stats.redelivered, 1);
    assert_eq!(stats.action_failures, 1);
    assert_eq!(sink.len(), 1);
    assert_eq!(x.unacked(), 1);
}
