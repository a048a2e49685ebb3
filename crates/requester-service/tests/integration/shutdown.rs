use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use requester_service::Engine;
use tokio::sync::Semaphore;

use crate::{Delivery, TestRequest, setup, submit, wait_until};

#[tokio::test]
async fn test_stop_waits_for_in_flight_requests() {
    setup();
    let probe = Arc::default();
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(Engine::new(10, 2).unwrap());

    let mut receivers = Vec::new();
    for i in 0..5 {
        let request = TestRequest::new(&format!("slow-{i}"), &probe).gated(&gate);
        receivers.push(submit(&engine, request).await);
    }
    // two are running, the other three wait for the throttle
    wait_until(|| probe.runs() == 2 && engine.stats().in_flight == 5).await;

    let stopping = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!stopping.is_finished());

    gate.add_permits(5);
    stopping.await.unwrap();

    // everything was delivered by the time `stop` returned
    for mut receiver in receivers {
        assert!(matches!(receiver.try_recv(), Ok(Delivery::Ran(Ok(_)))));
    }
    assert_eq!(probe.runs(), 5);
    assert_eq!(engine.stats().in_flight, 0);
}

#[tokio::test]
async fn test_stop_drains_queued_requests() {
    setup();
    let probe = Arc::default();
    let engine = Engine::new(10, 1).unwrap();

    let mut receivers = Vec::new();
    for i in 0..10 {
        let request = TestRequest::new(&format!("queued-{i}"), &probe);
        receivers.push(submit(&engine, request).await);
    }
    engine.stop().await;

    for delivery in join_all(receivers).await {
        assert!(matches!(delivery.unwrap(), Delivery::Ran(Ok(_))));
    }
    assert_eq!(probe.runs(), 10);
}

#[tokio::test]
async fn test_requests_after_stop_are_dropped() {
    setup();
    let probe = Arc::default();
    let engine = Engine::new(10, 1).unwrap();

    let before = submit(&engine, TestRequest::new("before", &probe)).await;
    engine.stop().await;
    assert!(before.await.is_ok());

    let after = submit(&engine, TestRequest::new("after", &probe)).await;
    assert!(after.await.is_err());
    // not even a cached result is handed out after stopping
    let cached = submit(&engine, TestRequest::new("before", &probe)).await;
    assert!(cached.await.is_err());

    assert_eq!(probe.runs(), 1);
}

#[tokio::test]
async fn test_stop_serves_non_cacheable_duplicates() {
    setup();
    let probe = Arc::default();
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(Engine::new(10, 1).unwrap());

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let request = TestRequest::new("volatile", &probe)
            .gated(&gate)
            .non_cacheable();
        receivers.push(submit(&engine, request).await);
    }
    wait_until(|| probe.runs() == 1 && engine.stats().waiting == 2).await;

    let stopping = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.stop().await }
    });
    gate.add_permits(3);
    stopping.await.unwrap();

    for mut receiver in receivers {
        assert!(matches!(receiver.try_recv(), Ok(Delivery::Ran(Ok(_)))));
    }
    assert_eq!(probe.runs(), 3);
}
