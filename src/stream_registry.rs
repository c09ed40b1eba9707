//! C3 — Stream Registry.
//!
//! Owns the per-stream event path for every outstanding streaming
//! generation: a `chunk`/`stats`/`error`/`completed` state machine keyed
//! by `streamId`, enforcing the active-stream cap, timeout, cancellation
//! and ack-based backpressure of spec.md §4.3.

use crate::error::{EngineError, EngineResult};
use crate::ids::StreamId;
use crate::time::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk { token: String, logprob: Option<f64> },
    Stats(StreamStats),
    Error { message: String },
    Completed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub time_to_first_token: Duration,
    pub tokens_per_sec: f64,
    pub total_tokens: u64,
    pub total_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamStatus::Active)
    }
}

struct StreamEntry {
    tenant_id: String,
    started_at: Instant,
    first_chunk_at: Option<Instant>,
    tokens_emitted: u64,
    unacked: u64,
    status: StreamStatus,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

/// Backpressure threshold: once unacked chunks exceed this, the registry
/// records backpressure so the governor can be informed (spec.md §4.3).
pub const DEFAULT_BACKPRESSURE_THRESHOLD: u64 = 64;

#[derive(Debug, Clone)]
pub struct StreamRegistryConfig {
    pub backpressure_threshold: u64,
    pub stream_timeout: Duration,
}

impl Default for StreamRegistryConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            stream_timeout: Duration::from_secs(300),
        }
    }
}

pub struct StreamRegistry {
    streams: DashMap<StreamId, StreamEntry>,
    active_count: AtomicU64,
    backpressured_count: AtomicU64,
    ttft_sum_nanos: AtomicU64,
    ttft_samples: AtomicU64,
    config: StreamRegistryConfig,
    clock: Arc<dyn Clock>,
}

/// Returned to the caller when a stream is registered: the consumer end
/// of the event channel plus bookkeeping needed to ack chunks.
pub struct StreamHandle {
    pub stream_id: StreamId,
    pub receiver: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamRegistry {
    pub fn new(config: StreamRegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: DashMap::new(),
            active_count: AtomicU64::new(0),
            backpressured_count: AtomicU64::new(0),
            ttft_sum_nanos: AtomicU64::new(0),
            ttft_samples: AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Drains the time-to-first-token samples recorded since the last
    /// call, for the Governor's periodic PID sample (spec.md §4.6).
    /// `None` if no stream produced a first token during the window.
    pub fn take_average_ttft_ms(&self) -> Option<f64> {
        let samples = self.ttft_samples.swap(0, Ordering::AcqRel);
        let sum_nanos = self.ttft_sum_nanos.swap(0, Ordering::AcqRel);
        if samples == 0 {
            return None;
        }
        Some((sum_nanos as f64 / samples as f64) / 1_000_000.0)
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Acquire)
    }

    /// Registers a new stream if `current_cap` allows it. The cap is owned
    /// by the Governor (spec.md's Open Question is resolved this way, see
    /// DESIGN.md); the registry only enforces whatever cap it is given.
    pub fn register(
        &self,
        stream_id: StreamId,
        tenant_id: impl Into<String>,
        current_cap: u64,
    ) -> EngineResult<StreamHandle> {
        if self.active_count.load(Ordering::Acquire) >= current_cap {
            return Err(EngineError::AtCapacity {
                reason: format!("at_capacity_{current_cap}"),
                retry_after: Some(Duration::from_millis(50)),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(
            stream_id,
            StreamEntry {
                tenant_id: tenant_id.into(),
                started_at: self.clock.now(),
                first_chunk_at: None,
                tokens_emitted: 0,
                unacked: 0,
                status: StreamStatus::Active,
                sender: tx,
            },
        );
        self.active_count.fetch_add(1, Ordering::AcqRel);
        Ok(StreamHandle {
            stream_id,
            receiver: rx,
        })
    }

    fn finish(&self, stream_id: StreamId, status: StreamStatus) {
        if let Some(mut entry) = self.streams.get_mut(&stream_id) {
            if entry.status.is_terminal() {
                return;
            }
            entry.status = status;
            self.active_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Delivers a token chunk; captures time-to-first-token on the first
    /// call (spec.md §4.3 state diagram).
    pub fn on_chunk(&self, stream_id: StreamId, token: String, logprob: Option<f64>) {
        let Some(mut entry) = self.streams.get_mut(&stream_id) else {
            warn!(%stream_id, "chunk for unknown stream");
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        if entry.first_chunk_at.is_none() {
            let now = self.clock.now();
            entry.first_chunk_at = Some(now);
            let ttft = now.saturating_duration_since(entry.started_at);
            self.ttft_sum_nanos.fetch_add(ttft.as_nanos() as u64, Ordering::AcqRel);
            self.ttft_samples.fetch_add(1, Ordering::AcqRel);
        }
        entry.tokens_emitted += 1;
        entry.unacked += 1;
        if entry.unacked > self.config.backpressure_threshold {
            self.backpressured_count.fetch_add(1, Ordering::AcqRel);
        }
        let _ = entry.sender.send(StreamEvent::Chunk { token, logprob });
    }

    pub fn on_stats(&self, stream_id: StreamId, stats: StreamStats) {
        if let Some(entry) = self.streams.get(&stream_id) {
            let _ = entry.sender.send(StreamEvent::Stats(stats));
        }
    }

    pub fn on_completed(&self, stream_id: StreamId) {
        if let Some(entry) = self.streams.get(&stream_id) {
            let _ = entry.sender.send(StreamEvent::Completed);
        }
        self.finish(stream_id, StreamStatus::Completed);
    }

    pub fn on_error(&self, stream_id: StreamId, message: String) {
        if let Some(entry) = self.streams.get(&stream_id) {
            let _ = entry.sender.send(StreamEvent::Error { message });
        }
        self.finish(stream_id, StreamStatus::Failed);
    }

    /// Cooperative cancellation: delivers a terminal event to the consumer
    /// (P2: exactly one terminal event per registered stream) and
    /// completes the stream with `Cancelled` locally; sending the
    /// fire-and-forget cancel notification to the child is the caller's
    /// (facade's) responsibility since it needs the transport.
    pub fn cancel(&self, stream_id: StreamId) {
        if let Some(entry) = self.streams.get(&stream_id) {
            if entry.status.is_terminal() {
                return;
            }
            let _ = entry.sender.send(StreamEvent::Error {
                message: "cancelled".to_string(),
            });
        }
        self.finish(stream_id, StreamStatus::Cancelled);
    }

    pub fn timeout(&self, stream_id: StreamId) {
        if let Some(entry) = self.streams.get(&stream_id) {
            let _ = entry.sender.send(StreamEvent::Error {
                message: "timeout".to_string(),
            });
        }
        self.finish(stream_id, StreamStatus::Cancelled);
    }

    /// Caller's consumer acks one delivered chunk, releasing backpressure
    /// credit (spec.md §4.3, §5 "Backpressure strategy").
    pub fn acknowledge_chunk(&self, stream_id: StreamId) {
        if let Some(mut entry) = self.streams.get_mut(&stream_id) {
            entry.unacked = entry.unacked.saturating_sub(1);
        }
    }

    pub fn unacked(&self, stream_id: StreamId) -> u64 {
        self.streams.get(&stream_id).map(|e| e.unacked).unwrap_or(0)
    }

    pub fn status(&self, stream_id: StreamId) -> Option<StreamStatus> {
        self.streams.get(&stream_id).map(|e| e.status)
    }

    pub fn time_to_first_token(&self, stream_id: StreamId) -> Option<Duration> {
        let entry = self.streams.get(&stream_id)?;
        let first = entry.first_chunk_at?;
        Some(first.saturating_duration_since(entry.started_at))
    }

    pub fn tenant_of(&self, stream_id: StreamId) -> Option<String> {
        self.streams.get(&stream_id).map(|e| e.tenant_id.clone())
    }

    pub fn timeout_duration(&self) -> Duration {
        self.config.stream_timeout
    }

    /// Forcibly cancels every active stream and drops bookkeeping (spec.md
    /// §4.3 "Orphan cleanup": invoked when the transport changes).
    pub fn cancel_all(&self) {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| *e.key())
            .collect();
        for id in ids {
            if let Some(entry) = self.streams.get(&id) {
                let _ = entry.sender.send(StreamEvent::Error {
                    message: "python_restart".to_string(),
                });
            }
            self.finish(id, StreamStatus::Cancelled);
        }
    }
}
