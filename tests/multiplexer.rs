//! P5: batched requests resolve in the order they were submitted, and a
//! size-triggered flush doesn't wait for the hold window.

use engine_core::multiplexer::{Multiplexer, MultiplexerConfig, Priority};
use engine_core::rpc::Correlator;
use engine_core::time::MockClock;
use engine_core::transport::mock::MockTransport;
use engine_core::transport::{Transport, TransportGeneration};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> MultiplexerConfig {
    MultiplexerConfig {
        min_hold: Duration::from_millis(2),
        max_hold: Duration::from_millis(50),
        min_batch_size: 2,
        max_batch_size: 3,
    }
}

async fn reply_to_latest_batch(mock: &MockTransport, correlator: &Correlator, result_count: usize) {
    loop {
        let sent = mock.sent_requests().await;
        if let Some(last) = sent.last() {
            if last.method.starts_with("batch_") {
                let results: Vec<_> = (0..result_count)
                    .map(|i| json!({"success": true, "result": i}))
                    .collect();
                correlator.resolve(last.id, Some(json!({"results": results})), None);
                return;
            }
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn size_triggered_flush_does_not_wait_for_hold_window() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let multiplexer = Multiplexer::new(config(), clock);
    let mock = MockTransport::new(TransportGeneration::initial());
    let transport: Arc<dyn Transport> = mock.clone();

    let reply_task = {
        let correlator = correlator.clone();
        let mock = mock.clone();
        tokio::spawn(async move {
            reply_to_latest_batch(&mock, &correlator, 3).await;
        })
    };

    let mut calls = Vec::new();
    for i in 0..3 {
        let multiplexer = multiplexer.clone();
        let correlator = correlator.clone();
        let transport = transport.clone();
        calls.push(tokio::spawn(async move {
            multiplexer
                .submit(
                    correlator,
                    transport,
                    "tokenize",
                    "model-a",
                    json!({"text": format!("chunk-{i}")}),
                    Priority::Normal,
                    Duration::from_secs(5),
                )
                .await
        }));
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!(i));
    }
    reply_task.await.unwrap();

    let stats = multiplexer.stats().await;
    assert_eq!(stats.dispatched_batches, 1);
    assert_eq!(stats.batched_requests, 3);
}

#[tokio::test]
async fn high_priority_bypasses_batching() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let multiplexer = Multiplexer::new(config(), clock);
    let mock = MockTransport::new(TransportGeneration::initial());
    let transport: Arc<dyn Transport> = mock.clone();

    let call = {
        let multiplexer = multiplexer.clone();
        let correlator = correlator.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            multiplexer
                .submit(correlator, transport, "tokenize", "model-a", json!({}), Priority::High, Duration::from_secs(5))
                .await
        })
    };

    tokio::task::yield_now().await;
    let sent = mock.sent_requests().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "tokenize");
    correlator.resolve(sent[0].id, Some(json!(42)), None);

    assert_eq!(call.await.unwrap().unwrap(), json!(42));
    assert_eq!(multiplexer.stats().await.solo_requests, 1);
}

#[tokio::test]
async fn cancel_all_rejects_queued_entries() {
    let clock = Arc::new(MockClock::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let multiplexer = Multiplexer::new(config(), clock);
    let mock = MockTransport::new(TransportGeneration::initial());
    let transport: Arc<dyn Transport> = mock;

    let call = {
        let multiplexer = multiplexer.clone();
        let correlator = correlator.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            multiplexer
                .submit(correlator, transport, "tokenize", "model-a", json!({}), Priority::Normal, Duration::from_secs(5))
                .await
        })
    };

    tokio::task::yield_now().await;
    multiplexer.cancel_all().await;

    let result = call.await.unwrap();
    assert!(matches!(result, Err(engine_core::EngineError::Cancelled)));
}
