//! P4 + spec.md §8 "subprocess restart reconciliation" scenario: every
//! previously-ready model is invalidated exactly once, and only models
//! the fresh child didn't already know about get unloaded.

use dashmap::DashMap;
use engine_core::events::EventBus;
use engine_core::governance::{BreakerConfig, CircuitBreaker};
use engine_core::ids::ModelId;
use engine_core::model::{Modality, ModelDescriptor, ModelHandle, ModelSource, ModelState};
use engine_core::multiplexer::{Multiplexer, MultiplexerConfig};
use engine_core::reconcile::Reconciler;
use engine_core::rpc::Correlator;
use engine_core::stream_registry::{StreamRegistry, StreamRegistryConfig};
use engine_core::time::MockClock;
use engine_core::transport::mock::MockTransport;
use engine_core::transport::{Transport, TransportGeneration};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn ready_handle(id: &str) -> ModelHandle {
    let now = Instant::now();
    let mut handle = ModelHandle::new(
        ModelId::from(id),
        ModelDescriptor {
            source: ModelSource::Local,
            modality: Modality::Text,
            family: None,
            context_length: None,
        },
        false,
        now,
    );
    handle.state = ModelState::Ready;
    handle
}

#[tokio::test]
async fn unloads_only_models_the_fresh_child_did_not_have_before() {
    let clock = Arc::new(MockClock::new());
    let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
    let streams = Arc::new(StreamRegistry::new(StreamRegistryConfig::default(), clock.clone()));
    let multiplexer = Multiplexer::new(MultiplexerConfig::default(), clock.clone());
    let events = EventBus::new();
    let models = Arc::new(DashMap::new());
    models.insert(ModelId::from("model-a"), ready_handle("model-a"));
    models.insert(ModelId::from("model-b"), ready_handle("model-b"));
    let correlator = Arc::new(Correlator::new(clock.clone()));

    let reconciler = Reconciler::new(breaker, streams, multiplexer, events, models.clone(), correlator.clone());

    let mock = MockTransport::new(TransportGeneration::from_raw(1));
    let transport: Arc<dyn Transport> = mock.clone();

    let reconcile_task = {
        let reconciler = reconciler.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            reconciler.ensure_reconciled(TransportGeneration::from_raw(1), transport).await;
        })
    };

    // child reports B (already known) and C (new, orphaned)
    loop {
        let sent = mock.sent_requests().await;
        if let Some(state_call) = sent.iter().find(|r| r.method == "runtime/state") {
            let id = state_call.id;
            correlator.resolve(
                id,
                Some(json!({
                    "loaded_models": [
                        {"model_id": "model-b"},
                        {"model_id": "model-c"},
                    ]
                })),
                None,
            );
            break;
        }
        tokio::task::yield_now().await;
    }

    loop {
        let sent = mock.sent_requests().await;
        if let Some(unload_call) = sent.iter().find(|r| r.method == "unload_model") {
            let id = unload_call.id;
            assert_eq!(unload_call.params["model_id"], json!("model-c"));
            correlator.resolve(id, Some(json!({})), None);
            break;
        }
        tokio::task::yield_now().await;
    }

    reconcile_task.await.unwrap();

    let sent = mock.sent_requests().await;
    let unload_calls: Vec<_> = sent.iter().filter(|r| r.method == "unload_model").collect();
    assert_eq!(unload_calls.len(), 1, "model-b was already known, only model-c should be unloaded");

    assert!(models.is_empty(), "both previously-ready models are invalidated from the live map");

    let outcome = reconciler.last_outcome();
    assert!(outcome.state_consistent);
    assert!(outcome.errors.is_empty());
}

#[tokio::test]
async fn second_call_for_the_same_generation_is_a_no_op() {
    let clock = Arc::new(MockClock::new());
    let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
    let streams = Arc::new(StreamRegistry::new(StreamRegistryConfig::default(), clock.clone()));
    let multiplexer = Multiplexer::new(MultiplexerConfig::default(), clock.clone());
    let events = EventBus::new();
    let models = Arc::new(DashMap::new());
    let correlator = Arc::new(Correlator::new(clock.clone()));
    let reconciler = Reconciler::new(breaker, streams, multiplexer, events, models, correlator.clone());

    let mock = MockTransport::new(TransportGeneration::from_raw(1));
    let transport: Arc<dyn Transport> = mock.clone();

    let reconcile_task = {
        let reconciler = reconciler.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            reconciler.ensure_reconciled(TransportGeneration::from_raw(1), transport).await;
        })
    };

    loop {
        let sent = mock.sent_requests().await;
        if let Some(state_call) = sent.iter().find(|r| r.method == "runtime/state") {
            correlator.resolve(state_call.id, Some(json!({"loaded_models": []})), None);
            break;
        }
        tokio::task::yield_now().await;
    }
    reconcile_task.await.unwrap();

    let before = mock.sent_requests().await.len();
    reconciler.ensure_reconciled(TransportGeneration::from_raw(1), transport).await;
    let after = mock.sent_requests().await.len();
    assert_eq!(before, after, "already-reconciled generation must not re-probe the child");
}
