//! Error taxonomy shared by every dispatcher component.
//!
//! Mirrors the stable-code-plus-context shape of the teacher crate's
//! `CoreError` (one `&'static` code per kind, an optional retry hint, an
//! optional boxed cause) but expressed as a closed `thiserror` enum since
//! every variant here is a fixed, spec-defined kind rather than an
//! open-ended extension point.

use std::time::Duration;

/// The taxonomy from spec.md §7. Every dispatcher component returns this
/// type; only the facade (C9) renders it to the wire `{code, message,
/// details}` shape callers see.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("backpressure: {reason}")]
    Backpressure {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("at capacity: {reason}")]
    AtCapacity {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("model not loaded: {model_id}")]
    ModelNotLoaded { model_id: String },

    #[error("model load failed: {message}")]
    ModelLoadError { message: String },

    #[error("tokenizer error: {message}")]
    TokenizerError { message: String },

    #[error("generation error: {message}")]
    GenerationError { message: String },

    #[error("invalid arguments: {message}")]
    ValidationError { message: String },

    #[error("runtime error: {message}")]
    RuntimeError { message: String },
}

impl EngineError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeError {
            message: message.into(),
        }
    }

    /// Validation-class errors are the caller's fault and must never count
    /// toward the circuit breaker's consecutive-failure counter (spec.md
    /// §4.7, §7, §9 "Circuit breaker false positives").
    pub fn is_client_fault(&self) -> bool {
        matches!(self, EngineError::ValidationError { .. } | EngineError::Cancelled)
    }

    /// Stable wire code for this error kind, used by [`EngineError::to_wire`].
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Transport { .. } => "transport_error",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::Backpressure { .. } => "backpressure",
            EngineError::AtCapacity { .. } => "at_capacity",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::ModelNotLoaded { .. } => "model_not_loaded",
            EngineError::ModelLoadError { .. } => "model_load_error",
            EngineError::TokenizerError { .. } => "tokenizer_error",
            EngineError::GenerationError { .. } => "generation_error",
            EngineError::ValidationError { .. } => "validation_error",
            EngineError::RuntimeError { .. } => "runtime_error",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Backpressure { retry_after, .. } => *retry_after,
            EngineError::AtCapacity { retry_after, .. } => *retry_after,
            EngineError::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Render the compact `{code, message, details}` shape spec.md §7
    /// requires at the facade boundary.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code(),
            message: self.to_string(),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub type EngineResult<T> = Result<T, EngineError>;
