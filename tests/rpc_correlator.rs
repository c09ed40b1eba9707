//! P1: every correlator request resolves exactly once, either with the
//! matching reply or with `Cancelled`/`Timeout` — never both, never
//! neither.

use engine_core::rpc::Correlator;
use engine_core::time::MockClock;
use engine_core::transport::mock::MockTransport;
use engine_core::transport::TransportGeneration;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn resolves_matching_reply() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let transport = MockTransport::new(TransportGeneration::initial());

    let call = {
        let correlator = correlator.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            correlator
                .request(&*transport, "runtime/info", json!({}), Duration::from_secs(5))
                .await
        })
    };

    // let the request land before we reply to it
    tokio::task::yield_now().await;
    let sent = transport.sent_requests().await;
    assert_eq!(sent.len(), 1);
    let id = sent[0].id;

    correlator.resolve(id, Some(json!({"ok": true})), None);

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, json!({"ok": true}));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn times_out_when_no_reply_arrives() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let transport = MockTransport::new(TransportGeneration::initial());

    let call = {
        let correlator = correlator.clone();
        let transport = transport.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            let fut = correlator.request(&*transport, "slow_method", json!({}), Duration::from_millis(100));
            tokio::pin!(fut);
            loop {
                tokio::select! {
                    result = &mut fut => break result,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {
                        clock.advance(Duration::from_millis(10));
                    }
                }
            }
        })
    };

    let result = call.await.unwrap();
    assert!(matches!(result, Err(engine_core::EngineError::Timeout { .. })));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn cancel_all_rejects_every_pending_call_with_cancelled() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock));
    let transport = MockTransport::new(TransportGeneration::initial());

    let mut calls = Vec::new();
    for _ in 0..5 {
        let correlator = correlator.clone();
        let transport = transport.clone();
        calls.push(tokio::spawn(async move {
            correlator
                .request(&*transport, "runtime/info", json!({}), Duration::from_secs(30))
                .await
        }));
    }
    tokio::task::yield_now().await;
    correlator.cancel_all();

    for call in calls {
        let result = call.await.unwrap();
        assert!(matches!(result, Err(engine_core::EngineError::Cancelled)));
    }
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn send_failure_removes_pending_entry_immediately() {
    let clock = Arc::new(MockClock::new());
    let correlator = Correlator::new(clock);
    let transport = MockTransport::new(TransportGeneration::initial());
    transport.set_fail_sends(true);

    let result = correlator
        .request(&*transport, "runtime/info", json!({}), Duration::from_secs(5))
        .await;
    assert!(result.is_err());
    assert_eq!(correlator.pending_count(), 0);
}
