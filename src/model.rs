//! Model Handle data model (spec.md §3).

use crate::ids::ModelId;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Loading,
    Ready,
    Failed,
    Evicting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Local,
    HuggingFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Vision,
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub source: ModelSource,
    pub modality: Modality,
    pub family: Option<String>,
    pub context_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub model_id: ModelId,
    pub state: ModelState,
    pub descriptor: ModelDescriptor,
    pub draft: bool,
    pub loaded_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
}

impl ModelHandle {
    pub fn new(model_id: ModelId, descriptor: ModelDescriptor, draft: bool, now: Instant) -> Self {
        Self {
            model_id,
            state: ModelState::Loading,
            descriptor,
            draft,
            loaded_at: now,
            last_access_at: now,
            access_count: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access_at = now;
        self.access_count += 1;
    }
}
