//! Typed pub-sub for caller-visible lifecycle events (spec.md §9 "Event
//! emitter"). Grounded on the teacher crate's
//! `governance::observability::events` module: a closed enum of stable
//! event kinds rather than an open `Arc<dyn Any>` bag, broadcast to every
//! listener with a catch-and-log boundary so one bad listener can never
//! break the component that raised the event.

use crate::ids::{ModelId, StreamId, TenantId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ModelLoaded { model_id: ModelId },
    ModelUnloaded { model_id: ModelId },
    ModelInvalidated { model_id: ModelId, reason: &'static str },
    GenerationToken { stream_id: StreamId },
    GenerationCompleted { stream_id: StreamId },
    RuntimeStatus { message: String },
    Admission { tenant_id: TenantId },
    LimitAdjusted { new_cap: u64 },
    SafeModeEntered { reason: String },
    PidUnstable,
    TenantRejected { tenant_id: TenantId, reason: String },
}

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync + 'static>;

/// Broadcasts events to every registered listener. Listener panics are
/// caught and logged, never propagated to the emitter (spec.md §9 "Event
/// emitter": "Listener errors must not propagate to emitters").
#[derive(Default)]
pub struct EventBus {
    listeners: parking_lot::RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: EngineEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(panic) = outcome {
                error!(?panic, "event listener panicked");
            }
        }
    }
}
