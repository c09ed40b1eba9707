//! C2 — RPC Correlator.
//!
//! Assigns monotonic request ids, parks callers on a pending-request map
//! keyed by id (a `dashmap`, grounded on the teacher crate's use of
//! `dashmap` for exactly this kind of short-critical-section shared map),
//! and resolves them when a matching response arrives or the per-call
//! timeout expires.

use crate::error::{EngineError, EngineResult};
use crate::ids::{RequestId, RequestIdAllocator};
use crate::protocol::{WireNotification, WireRequest, WireRpcError};
use crate::time::Clock;
use crate::transport::Transport;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Default cap on outstanding RPCs (spec.md §4.2, §6 `maxPendingRequests`);
/// overridden via [`Correlator::with_max_pending`] from `EngineOptions`.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 100;

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl From<WireRpcError> for RpcError {
    fn from(value: WireRpcError) -> Self {
        Self {
            code: value.code,
            message: value.message,
            data: value.data,
        }
    }
}

struct Pending {
    resolver: oneshot::Sender<EngineResult<Value>>,
}

/// Owns the pending-request map for one transport generation. Recreated
/// whenever the supervisor installs a new transport (spec.md §4.5
/// "group cleanup runs on transport change" applies equally to pending
/// RPCs, which all become `Cancelled`).
pub struct Correlator {
    ids: RequestIdAllocator,
    pending: DashMap<RequestId, Pending>,
    clock: Arc<dyn Clock>,
    max_pending: usize,
}

impl Correlator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_pending(clock, DEFAULT_MAX_PENDING_REQUESTS)
    }

    /// Same as [`Correlator::new`] but with an explicit cap on outstanding
    /// RPCs (spec.md §6 `maxPendingRequests`), as configured via
    /// `EngineOptions`.
    pub fn with_max_pending(clock: Arc<dyn Clock>, max_pending: usize) -> Self {
        Self {
            ids: RequestIdAllocator::default(),
            pending: DashMap::new(),
            clock,
            max_pending,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends `method(params)` to `transport` and awaits the matching reply,
    /// honoring `timeout`. On timeout the entry is removed and a late
    /// reply is silently dropped by [`Correlator::resolve`] (spec.md §4.2
    /// step 3).
    pub async fn request(
        &self,
        transport: &dyn Transport,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> EngineResult<Value> {
        if self.pending.len() >= self.max_pending {
            return Err(EngineError::Backpressure {
                reason: format!("max_pending_requests_{}", self.max_pending),
                retry_after: Some(Duration::from_millis(50)),
            });
        }

        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { resolver: tx });

        let wire = WireRequest::new(id.as_u64(), method, params);
        if let Err(error) = transport.send_request(&wire).await {
            self.pending.remove(&id);
            return Err(error);
        }

        let sleep = self.clock.sleep(timeout);
        tokio::select! {
            reply = rx => {
                reply.unwrap_or(Err(EngineError::Cancelled))
            }
            _ = sleep => {
                self.pending.remove(&id);
                Err(EngineError::Timeout { elapsed: timeout })
            }
        }
    }

    /// Routes one response to its waiting caller. Unmatched ids are
    /// dropped with a warning (spec.md §3 "Request" invariant).
    pub fn resolve(&self, id: u64, result: Option<Value>, error: Option<WireRpcError>) {
        let id = RequestId::from_raw(id);
        let Some((_, pending)) = self.pending.remove(&id) else {
            warn!(request_id = %id, "reply for unknown or already-resolved request");
            return;
        };
        let outcome = match error {
            Some(err) => {
                let rpc_error: RpcError = err.into();
                Err(EngineError::RuntimeError {
                    message: format!("{}: {}", rpc_error.code, rpc_error.message),
                })
            }
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = pending.resolver.send(outcome);
    }

    /// Shutdown rejects every pending call with `Cancelled` (spec.md §4.2,
    /// §5, L2).
    pub fn cancel_all(&self) {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.resolver.send(Err(EngineError::Cancelled));
            }
        }
    }

    pub async fn notify(&self, transport: &dyn Transport, method: &str, params: Value) -> EngineResult<()> {
        transport
            .send_notification(&WireNotification::new(method, params))
            .await
    }
}
