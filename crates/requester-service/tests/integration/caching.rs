use std::sync::Arc;

use requester_service::Engine;
use requester_service::config::EngineConfig;

use crate::{Delivery, TestRequest, setup, submit, wait_until};

#[tokio::test]
async fn test_evicted_results_run_again() {
    setup();
    let probe = Arc::default();
    let engine = Engine::new(2, 1).unwrap();

    for id in ["A", "B", "C"] {
        let receiver = submit(&engine, TestRequest::new(id, &probe)).await;
        assert!(matches!(receiver.await.unwrap(), Delivery::Ran(_)));
        wait_until(|| engine.stats().in_flight == 0).await;
    }
    assert_eq!(engine.stats().cached, 2);

    // "A" was evicted by "C"
    let receiver = submit(&engine, TestRequest::new("A", &probe)).await;
    assert_eq!(
        receiver.await.unwrap(),
        Delivery::Ran(Ok("result of A".into()))
    );
    wait_until(|| engine.stats().in_flight == 0).await;

    // "C" is still cached, "B" got evicted by the second "A"
    let receiver = submit(&engine, TestRequest::new("C", &probe)).await;
    assert_eq!(
        receiver.await.unwrap(),
        Delivery::Shared(Ok("result of C".into()))
    );
    let receiver = submit(&engine, TestRequest::new("B", &probe)).await;
    assert!(matches!(receiver.await.unwrap(), Delivery::Ran(_)));

    assert_eq!(probe.runs(), 5);
    engine.stop().await;
}

#[tokio::test]
async fn test_non_cacheable_results_are_not_cached() {
    setup();
    let probe = Arc::default();
    let engine = Engine::new(2, 1).unwrap();

    for _ in 0..3 {
        let request = TestRequest::new("volatile", &probe).non_cacheable();
        let receiver = submit(&engine, request).await;
        assert!(matches!(receiver.await.unwrap(), Delivery::Ran(_)));
        wait_until(|| engine.stats().in_flight == 0).await;
    }

    assert_eq!(probe.runs(), 3);
    assert_eq!(engine.stats().cached, 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_engine_from_config() {
    setup();
    let probe = Arc::default();
    let config = EngineConfig::new(1, 1).unwrap();
    let engine = Engine::from_config(&config);

    let first = submit(&engine, TestRequest::new("one", &probe)).await;
    assert!(matches!(first.await.unwrap(), Delivery::Ran(_)));
    wait_until(|| engine.stats().in_flight == 0).await;

    // a capacity of one only remembers the latest result
    let second = submit(&engine, TestRequest::new("two", &probe)).await;
    assert!(matches!(second.await.unwrap(), Delivery::Ran(_)));
    wait_until(|| engine.stats().in_flight == 0).await;
    let third = submit(&engine, TestRequest::new("one", &probe)).await;
    assert!(matches!(third.await.unwrap(), Delivery::Ran(_)));

    assert_eq!(probe.runs(), 3);
    engine.stop().await;
}
