//! C8 — Reconciler.
//!
//! After the supervisor installs a new transport (a restart), walks the
//! caller-visible model set, invalidates every previously-ready handle,
//! clears per-transport dependents, and asks the fresh child to unload
//! anything it claims that we never did (spec.md §4.8). Guarded by a
//! single in-flight async mutex so reconciliation never runs twice
//! concurrently — every other caller simply awaits the same lock, which
//! is the teacher crate's "single-slot in-flight future" pattern
//! (spec.md §9 "Reconciliation atomicity") expressed with a plain
//! `tokio::sync::Mutex` instead of a hand-rolled shared future.

use crate::events::{EngineEvent, EventBus};
use crate::governance::CircuitBreaker;
use crate::ids::ModelId;
use crate::model::{ModelHandle, ModelState};
use crate::multiplexer::Multiplexer;
use crate::rpc::Correlator;
use crate::stream_registry::StreamRegistry;
use crate::transport::{Transport, TransportGeneration};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub state_consistent: bool,
    pub errors: Vec<String>,
}

pub struct Reconciler {
    breaker: Arc<CircuitBreaker>,
    streams: Arc<StreamRegistry>,
    multiplexer: Arc<Multiplexer>,
    events: Arc<EventBus>,
    models: Arc<DashMap<ModelId, ModelHandle>>,
    correlator: Arc<Correlator>,
    last_reconciled_generation: AtomicU64,
    inflight: AsyncMutex<()>,
    last_outcome: parking_lot::Mutex<ReconcileOutcome>,
}

impl Reconciler {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        streams: Arc<StreamRegistry>,
        multiplexer: Arc<Multiplexer>,
        events: Arc<EventBus>,
        models: Arc<DashMap<ModelId, ModelHandle>>,
        correlator: Arc<Correlator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            breaker,
            streams,
            multiplexer,
            events,
            models,
            correlator,
            last_reconciled_generation: AtomicU64::new(TransportGeneration::initial().as_raw()),
            inflight: AsyncMutex::new(()),
            last_outcome: parking_lot::Mutex::new(ReconcileOutcome::default()),
        })
    }

    pub fn last_outcome(&self) -> ReconcileOutcome {
        self.last_outcome.lock().clone()
    }

    /// Ensures reconciliation has run for `generation`. Cheap no-op if it
    /// already has; otherwise only one caller actually does the work,
    /// every other concurrent caller awaits the same lock and then
    /// observes the already-updated generation marker.
    pub async fn ensure_reconciled(&self, generation: TransportGeneration, transport: Arc<dyn Transport>) {
        if self.last_reconciled_generation.load(Ordering::Acquire) == generation.as_raw() {
            return;
        }
        let _guard = self.inflight.lock().await;
        if self.last_reconciled_generation.load(Ordering::Acquire) == generation.as_raw() {
            return;
        }
        let outcome = self.run(transport).await;
        *self.last_outcome.lock() = outcome;
        self.last_reconciled_generation.store(generation.as_raw(), Ordering::Release);
    }

    async fn run(&self, transport: Arc<dyn Transport>) -> ReconcileOutcome {
        info!("reconciling dispatcher state after transport change");

        let old_ready: Vec<ModelId> = self
            .models
            .iter()
            .filter(|entry| entry.value().state == ModelState::Ready)
            .map(|entry| entry.key().clone())
            .collect();

        for model_id in &old_ready {
            self.events.emit(EngineEvent::ModelInvalidated {
                model_id: model_id.clone(),
                reason: "python_restart",
            });
            self.models.remove(model_id);
        }

        self.streams.cancel_all();
        self.multiplexer.cancel_all().await;

        if let Err(error) = self.breaker.try_acquire() {
            warn!(%error, "circuit open, skipping reconciliation probe");
            return ReconcileOutcome {
                state_consistent: false,
                errors: vec![error.to_string()],
            };
        }

        let probe = self
            .correlator
            .request(&*transport, "runtime/state", json!({}), Duration::from_secs(5))
            .await;

        match probe {
            Ok(value) => {
                let new_loaded: HashSet<ModelId> = value
                    .get("loaded_models")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|entry| entry.get("model_id").and_then(|m| m.as_str()))
                    .map(ModelId::from)
                    .collect();
                let old_set: HashSet<ModelId> = old_ready.into_iter().collect();

                let mut errors = Vec::new();
                for orphan in new_loaded.difference(&old_set) {
                    let result = self
                        .correlator
                        .request(
                            &*transport,
                            "unload_model",
                            json!({ "model_id": orphan.as_str() }),
                            Duration::from_secs(5),
                        )
                        .await;
                    if let Err(error) = result {
                        warn!(%error, model_id = %orphan, "failed to unload orphaned model during reconciliation");
                        errors.push(format!("unload {orphan}: {error}"));
                    }
                }

                self.breaker.on_result(&Ok(()));
                ReconcileOutcome {
                    state_consistent: true,
                    errors,
                }
            }
            Err(error) => {
                self.breaker.on_result(&Err(error.clone()));
                ReconcileOutcome {
                    state_consistent: false,
                    errors: vec![error.to_string()],
                }
            }
        }
    }
}
