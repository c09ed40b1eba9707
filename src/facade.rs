//! C9 — Engine Facade.
//!
//! The only public surface callers touch. Wires C1-C8 together, accepts
//! either `camelCase` or `snake_case` argument keys (spec.md §5), and
//! renders every error through [`EngineError::to_wire`] so nothing past
//! this boundary ever exposes an internal enum.

use crate::config::EngineOptions;
use crate::error::{EngineError, EngineResult, WireError};
use crate::events::{EngineEvent, EventBus, Listener};
use crate::governance::{AdmissionDecision, BreakerState, CircuitBreaker, Governor};
use crate::ids::{ModelId, StreamId, TenantId};
use crate::model::{Modality, ModelDescriptor, ModelHandle, ModelSource, ModelState};
use crate::multiplexer::{Multiplexer, Priority};
use crate::normalize::normalize_keys;
use crate::protocol::notifications;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::rpc::Correlator;
use crate::stream_registry::{StreamEvent, StreamHandle, StreamRegistry};
use crate::supervisor::{RawNotification, Supervisor, SupervisorState};
use crate::time::{Clock, SystemClock};
use crate::transport::Transport;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Generation params accepted by [`Engine::create_generator`], after key
/// normalization. Unknown fields are passed through to the child
/// verbatim; only the handful the dispatcher itself interprets are
/// pulled out here.
fn model_id_of(params: &Value) -> EngineResult<ModelId> {
    params
        .get("model_id")
        .and_then(Value::as_str)
        .map(ModelId::from)
        .ok_or_else(|| EngineError::ValidationError {
            message: "missing required field `model_id` (or `modelId`)".to_string(),
        })
}

fn tenant_id_of(params: &Value) -> TenantId {
    params
        .get("tenant_id")
        .and_then(Value::as_str)
        .map(TenantId::new)
        .unwrap_or_else(TenantId::default_bucket)
}

pub struct CacheStats {
    pub loaded_models: u64,
    pub active_streams: u64,
    pub pending_requests: usize,
    pub governor_cap: u64,
    pub dispatched_batches: u64,
}

pub struct HealthStatus {
    pub supervisor: SupervisorState,
    pub breaker: BreakerState,
    pub state_consistent: bool,
    pub state_errors: Vec<String>,
}

/// The dispatcher. One instance owns one child subprocess lifecycle.
pub struct Engine {
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    correlator: Arc<Correlator>,
    supervisor: Arc<Supervisor>,
    multiplexer: Arc<Multiplexer>,
    streams: Arc<StreamRegistry>,
    governor: Arc<Governor>,
    breaker: Arc<CircuitBreaker>,
    reconciler: Arc<Reconciler>,
    events: Arc<EventBus>,
    models: Arc<DashMap<ModelId, ModelHandle>>,
}

impl Engine {
    /// Boots the supervised child and blocks until it is ready or the
    /// bounded restart budget is exhausted (spec.md §4.4).
    pub async fn start(options: EngineOptions) -> EngineResult<Arc<Self>> {
        Self::start_with_clock(options, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(options: EngineOptions, clock: Arc<dyn Clock>) -> EngineResult<Arc<Self>> {
        let correlator = Arc::new(Correlator::with_max_pending(clock.clone(), options.max_pending_requests));
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            options.supervisor.clone(),
            clock.clone(),
            correlator.clone(),
            notifications_tx,
        );
        let multiplexer = Multiplexer::new(options.multiplexer.clone(), clock.clone());
        let streams = Arc::new(StreamRegistry::new(options.stream_registry.clone(), clock.clone()));
        let events = EventBus::new();
        let governor = Governor::new(options.governor.clone(), clock.clone(), events.clone());
        let breaker = CircuitBreaker::new(options.breaker.clone(), clock.clone());
        let models = Arc::new(DashMap::new());
        let reconciler = Reconciler::new(
            breaker.clone(),
            streams.clone(),
            multiplexer.clone(),
            events.clone(),
            models.clone(),
            correlator.clone(),
        );

        let engine = Arc::new(Self {
            clock,
            options,
            correlator,
            supervisor: supervisor.clone(),
            multiplexer,
            streams,
            governor,
            breaker,
            reconciler,
            events,
            models,
        });

        engine.spawn_notification_router(notifications_rx);
        engine.spawn_pid_sampler();
        supervisor.start().await?;
        Ok(engine)
    }

    /// Periodically feeds the observed average time-to-first-token into
    /// the Governor's PID loop (spec.md §4.6, P6). Runs for the lifetime
    /// of the engine; a window with no completed first tokens is simply
    /// skipped rather than treated as a zero-TTFT sample.
    fn spawn_pid_sampler(self: &Arc<Self>) {
        if !self.options.governor.enabled {
            return;
        }
        let this = self.clone();
        let interval = self.options.governor.sample_interval;
        tokio::spawn(async move {
            loop {
                this.clock.sleep(interval).await;
                if let Some(ttft_ms) = this.streams.take_average_ttft_ms() {
                    this.governor.sample(ttft_ms);
                    this.events.emit(EngineEvent::LimitAdjusted {
                        new_cap: this.governor.current_cap(),
                    });
                }
            }
        });
    }

    pub fn subscribe(&self, listener: Listener) {
        self.events.subscribe(listener);
    }

    fn transport(&self) -> EngineResult<Arc<dyn Transport>> {
        self.supervisor
            .get_transport()
            .ok_or_else(|| EngineError::runtime("child not ready"))
    }

    async fn reconciled_transport(&self) -> EngineResult<Arc<dyn Transport>> {
        let transport = self.transport()?;
        self.reconciler
            .ensure_reconciled(transport.generation(), transport.clone())
            .await;
        self.transport()
    }

    fn spawn_notification_router(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<RawNotification>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                this.handle_notification(notification);
            }
        });
    }

    fn handle_notification(&self, notification: RawNotification) {
        match notification.method.as_str() {
            "stream_chunk" => {
                if let Ok(chunk) = serde_json::from_value::<notifications::StreamChunk>(notification.params) {
                    if let Ok(stream_id) = StreamId::parse(&chunk.stream_id) {
                        self.streams.on_chunk(stream_id, chunk.token, chunk.logprob);
                        self.events.emit(EngineEvent::GenerationToken { stream_id });
                    }
                }
            }
            "stream_stats" => {
                if let Ok(stats) = serde_json::from_value::<notifications::StreamStats>(notification.params) {
                    if let Ok(stream_id) = StreamId::parse(&stats.stream_id) {
                        self.streams.on_stats(
                            stream_id,
                            crate::stream_registry::StreamStats {
                                time_to_first_token: Duration::from_secs_f64(stats.time_to_first_token),
                                tokens_per_sec: stats.tokens_per_sec,
                                total_tokens: stats.tokens_generated,
                                total_time: Duration::from_secs_f64(stats.total_time),
                            },
                        );
                    }
                }
            }
            "stream_event" => {
                if let Ok(event) = serde_json::from_value::<notifications::StreamEvent>(notification.params) {
                    if let Ok(stream_id) = StreamId::parse(&event.stream_id) {
                        match event.kind {
                            notifications::StreamEventKind::Completed => {
                                self.streams.on_completed(stream_id);
                                self.events.emit(EngineEvent::GenerationCompleted { stream_id });
                                if let Some(tenant) = self.streams.tenant_of(stream_id) {
                                    self.governor.release_tenant(&TenantId::new(tenant));
                                }
                            }
                            notifications::StreamEventKind::Error => {
                                self.streams.on_error(stream_id, event.message.unwrap_or_default());
                                if let Some(tenant) = self.streams.tenant_of(stream_id) {
                                    self.governor.release_tenant(&TenantId::new(tenant));
                                }
                            }
                        }
                    }
                }
            }
            "runtime_status" => {
                self.events.emit(EngineEvent::RuntimeStatus {
                    message: notification.params.to_string(),
                });
            }
            other => {
                warn!(method = other, "unrecognized notification from child");
            }
        }
    }

    /// Idempotent per spec.md L1: loading an already-ready model is a
    /// no-op that returns the existing handle.
    pub async fn load_model(&self, params: Value) -> EngineResult<ModelId> {
        let params = normalize_keys(params);
        let model_id = model_id_of(&params)?;

        if let Some(existing) = self.models.get(&model_id) {
            if existing.state == ModelState::Ready {
                return Ok(model_id);
            }
        }

        let transport = self.reconciled_transport().await?;
        let modality = match params.get("modality").and_then(Value::as_str) {
            Some("vision") => Modality::Vision,
            _ => Modality::Text,
        };
        let source = match params.get("source").and_then(Value::as_str) {
            Some("huggingface") => ModelSource::HuggingFace,
            _ => ModelSource::Local,
        };
        let draft = params.get("draft").and_then(Value::as_bool).unwrap_or(false);

        let now = self.clock.now();
        self.models.insert(
            model_id.clone(),
            ModelHandle::new(
                model_id.clone(),
                ModelDescriptor {
                    source,
                    modality,
                    family: params.get("family").and_then(Value::as_str).map(String::from),
                    context_length: params.get("context_length").and_then(Value::as_u64),
                },
                draft,
                now,
            ),
        );

        let outcome = self
            .correlator
            .request(&*transport, "load_model", params, self.options.supervisor.startup_timeout)
            .await;

        match outcome {
            Ok(_) => {
                if let Some(mut handle) = self.models.get_mut(&model_id) {
                    handle.state = ModelState::Ready;
                }
                self.events.emit(EngineEvent::ModelLoaded { model_id: model_id.clone() });
                Ok(model_id)
            }
            Err(error) => {
                if let Some(mut handle) = self.models.get_mut(&model_id) {
                    handle.state = ModelState::Failed;
                }
                Err(EngineError::ModelLoadError { message: error.to_string() })
            }
        }
    }

    /// Idempotent per L1: unloading an absent model is a no-op.
    pub async fn unload_model(&self, params: Value) -> EngineResult<()> {
        let params = normalize_keys(params);
        let model_id = model_id_of(&params)?;
        if !self.models.contains_key(&model_id) {
            return Ok(());
        }
        let transport = self.reconciled_transport().await?;
        if let Some(mut handle) = self.models.get_mut(&model_id) {
            handle.state = ModelState::Evicting;
        }
        let _ = self
            .correlator
            .request(&*transport, "unload_model", json!({ "model_id": model_id.as_str() }), Duration::from_secs(10))
            .await;
        self.models.remove(&model_id);
        self.events.emit(EngineEvent::ModelUnloaded { model_id });
        Ok(())
    }

    pub fn list_models(&self) -> Vec<ModelHandle> {
        self.models.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Opens a new streaming generation. Checked against the Governor's
    /// cap and the tenant's admission budget before the stream is
    /// registered (spec.md §4.6, §4.3).
    pub async fn create_generator(&self, params: Value) -> EngineResult<StreamHandle> {
        let params = normalize_keys(params);
        let model_id = model_id_of(&params)?;
        let tenant_id = tenant_id_of(&params);

        match self.models.get(&model_id).map(|h| h.state) {
            Some(ModelState::Ready) => {}
            _ => {
                return Err(EngineError::ModelNotLoaded { model_id: model_id.to_string() });
            }
        }

        match self.governor.evaluate(&tenant_id) {
            AdmissionDecision::Admit => {}
            AdmissionDecision::Queue { reason } => {
                return Err(EngineError::AtCapacity { reason, retry_after: Some(Duration::from_millis(50)) });
            }
            AdmissionDecision::Reject { reason } => {
                self.events.emit(EngineEvent::TenantRejected { tenant_id, reason: reason.clone() });
                return Err(EngineError::Backpressure { reason, retry_after: None });
            }
            AdmissionDecision::SafeMode => {
                return Err(EngineError::AtCapacity {
                    reason: "safe_mode".to_string(),
                    retry_after: Some(Duration::from_secs(1)),
                });
            }
        }

        let transport = self.reconciled_transport().await?;
        let stream_id = StreamId::new();
        let handle = match self.streams.register(stream_id, tenant_id.as_str(), self.governor.current_cap()) {
            Ok(handle) => handle,
            Err(error) => {
                self.governor.release_tenant(&tenant_id);
                return Err(error);
            }
        };

        self.events.emit(EngineEvent::Admission { tenant_id: tenant_id.clone() });

        let mut request_params = params;
        if let Value::Object(ref mut map) = request_params {
            map.insert("stream_id".to_string(), json!(stream_id.to_string()));
        }
        // `generate` is a real id'd request: the child acknowledges it
        // synchronously (spec.md §2 data flow, §6 wire table "ack only"),
        // then streams results back as `stream_chunk`/`stream_stats`/
        // `stream_event` notifications handled in `handle_notification`.
        if let Err(error) = self
            .correlator
            .request(&*transport, "generate", request_params, Duration::from_secs(10))
            .await
        {
            self.streams.cancel(stream_id);
            self.governor.release_tenant(&tenant_id);
            return Err(error);
        }

        if let Some(mut model) = self.models.get_mut(&model_id) {
            model.touch(self.clock.now());
        }

        Ok(handle)
    }

    pub fn acknowledge_chunk(&self, stream_id: StreamId) {
        self.streams.acknowledge_chunk(stream_id);
    }

    /// Non-streaming convenience over [`Engine::create_generator`]
    /// (spec.md §4.8 Engine Facade table): drives the stream to completion
    /// and concatenates every token chunk into one string.
    pub async fn generate(&self, params: Value) -> EngineResult<String> {
        let mut handle = self.create_generator(params).await?;
        let mut text = String::new();
        while let Some(event) = handle.receiver.recv().await {
            match event {
                StreamEvent::Chunk { token, .. } => {
                    text.push_str(&token);
                    self.acknowledge_chunk(handle.stream_id);
                }
                StreamEvent::Stats(_) => {}
                StreamEvent::Completed => break,
                StreamEvent::Error { message } => {
                    return Err(EngineError::GenerationError { message });
                }
            }
        }
        Ok(text)
    }

    pub async fn cancel_generation(&self, stream_id: StreamId) -> EngineResult<()> {
        let transport = self.transport()?;
        self.streams.cancel(stream_id);
        self.correlator
            .notify(&*transport, "cancel_generation", json!({ "stream_id": stream_id.to_string() }))
            .await
    }

    /// Batchable, non-streaming call routed through the multiplexer
    /// (spec.md §4.5). Falls back to a solo call when the running child
    /// never advertised `batch_tokenize` in its `runtime/info` capability
    /// list (spec.md §4.8 step 6, §9 "Capability detection").
    pub async fn tokenize(&self, params: Value) -> EngineResult<Value> {
        let params = normalize_keys(params);
        let model_id = model_id_of(&params)?;
        let transport = self.reconciled_transport().await?;
        if let Some(mut model) = self.models.get_mut(&model_id) {
            model.touch(self.clock.now());
        }
        let priority = self.batch_priority_for("batch_tokenize");
        self.multiplexer
            .submit(
                self.correlator.clone(),
                transport,
                "tokenize",
                model_id.as_str(),
                params,
                priority,
                Duration::from_secs(10),
            )
            .await
    }

    /// Checks whether a draft (speculative-decoding) model is eligible to
    /// accompany `model_id`, per spec.md §3/§6's `check_draft` wire
    /// method. Batchable under the same capability gate as `tokenize`.
    pub async fn check_draft(&self, params: Value) -> EngineResult<Value> {
        let params = normalize_keys(params);
        let model_id = model_id_of(&params)?;
        let transport = self.reconciled_transport().await?;
        if let Some(mut model) = self.models.get_mut(&model_id) {
            model.touch(self.clock.now());
        }
        let priority = self.batch_priority_for("batch_check_draft");
        self.multiplexer
            .submit(
                self.correlator.clone(),
                transport,
                "check_draft",
                model_id.as_str(),
                params,
                priority,
                Duration::from_secs(10),
            )
            .await
    }

    /// `Priority::High` bypasses the multiplexer's hold window entirely
    /// (see `Multiplexer::submit`), which is how a missing capability
    /// turns batching off for one method without touching the
    /// multiplexer itself.
    fn batch_priority_for(&self, batch_method: &str) -> Priority {
        if self.supervisor.has_capability(batch_method) {
            Priority::Normal
        } else {
            Priority::High
        }
    }

    pub async fn warmup_model(&self, params: Value) -> EngineResult<()> {
        let params = normalize_keys(params);
        let transport = self.reconciled_transport().await?;
        self.correlator
            .request(&*transport, "warmup_model", params, Duration::from_secs(30))
            .await
            .map(|_| ())
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        CacheStats {
            loaded_models: self.models.iter().filter(|e| e.value().state == ModelState::Ready).count() as u64,
            active_streams: self.streams.active_count(),
            pending_requests: self.correlator.pending_count(),
            governor_cap: self.governor.current_cap(),
            dispatched_batches: self.multiplexer.stats().await.dispatched_batches,
        }
    }

    pub async fn health_check(&self) -> HealthStatus {
        let ReconcileOutcome { state_consistent, errors } = self.reconciler.last_outcome();
        HealthStatus {
            supervisor: self.supervisor.state(),
            breaker: self.breaker.state(),
            state_consistent,
            state_errors: errors,
        }
    }

    /// Graceful, idempotent shutdown (spec.md L2): every pending RPC and
    /// active stream rejects with `Cancelled`, the child is asked to
    /// exit, and calling this twice is a no-op.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.correlator.cancel_all();
        self.streams.cancel_all();
        self.multiplexer.cancel_all().await;
        self.supervisor.stop().await;
    }

    pub fn render_error(error: &EngineError) -> WireError {
        error.to_wire()
    }
}
