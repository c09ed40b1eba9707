//! C6 — Adaptive Governor.
//!
//! Combines the PID-controlled concurrency cap with per-tenant admission
//! budgets (spec.md §4.6). The admission outcome enum mirrors the shape
//! of the teacher crate's `status::ready::ReadyCheck`
//! (`Ready`/`Busy`/`BudgetExhausted`/`RetryAfter`) — this dispatcher's
//! `admit`/`queue`/`reject`/`safe-mode` is the same four-way shape,
//! applied to admission instead of generic service readiness.

use super::pid::{PidGains, PidState};
use crate::events::{EngineEvent, EventBus};
use crate::ids::TenantId;
use crate::time::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct TenantBudget {
    pub hard_limit: u64,
    pub burst_limit: u64,
    pub decay: Duration,
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub enabled: bool,
    pub target_ttft_ms: f64,
    pub min_streams: u64,
    pub max_streams: u64,
    pub gains: PidGains,
    pub sample_interval: Duration,
    pub default_budget: Option<TenantBudget>,
    pub tenant_budgets: std::collections::HashMap<String, TenantBudget>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_ttft_ms: 200.0,
            min_streams: 1,
            max_streams: 32,
            gains: PidGains::default(),
            sample_interval: Duration::from_secs(1),
            default_budget: None,
            tenant_budgets: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admit,
    Queue { reason: String },
    Reject { reason: String },
    SafeMode,
}

struct TenantUsage {
    current: u64,
    burst_count: u64,
    burst_reset_at: Option<Instant>,
}

impl Default for TenantUsage {
    fn default() -> Self {
        Self {
            current: 0,
            burst_count: 0,
            burst_reset_at: None,
        }
    }
}

pub struct Governor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    pid: parking_lot::Mutex<PidState>,
    cap: AtomicU64,
    active_streams: AtomicU64,
    safe_mode: AtomicBool,
    tenants: DashMap<TenantId, TenantUsage>,
}

impl Governor {
    pub fn new(config: GovernorConfig, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Arc<Self> {
        let initial_cap = config.max_streams;
        Arc::new(Self {
            config,
            clock,
            events,
            pid: parking_lot::Mutex::new(PidState::default()),
            cap: AtomicU64::new(initial_cap),
            active_streams: AtomicU64::new(0),
            safe_mode: AtomicBool::new(false),
            tenants: DashMap::new(),
        })
    }

    pub fn current_cap(&self) -> u64 {
        self.cap.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Acquire)
    }

    /// One PID sample period: `measured_ttft_ms` is the observed average
    /// TTFT over the last sample interval. Updates the cap in place
    /// (spec.md §4.6, P6).
    pub fn sample(&self, measured_ttft_ms: f64) {
        let dt = self.config.sample_interval.as_secs_f64();
        let mut pid = self.pid.lock();
        let output = pid.step(measured_ttft_ms, self.config.target_ttft_ms, dt, self.config.gains);
        drop(pid);

        match output {
            Some(output) => {
                let current = self.current_cap() as i64;
                let next = (current - output.round() as i64).clamp(
                    self.config.min_streams as i64,
                    self.config.max_streams as i64,
                );
                self.cap.store(next as u64, Ordering::Release);
            }
            None => {
                warn!("pid output non-finite, resetting cap to max_streams");
                self.cap.store(self.config.max_streams, Ordering::Release);
                self.events.emit(EngineEvent::PidUnstable);
            }
        }
    }

    pub fn enter_safe_mode(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.safe_mode.store(true, Ordering::Release);
        self.cap.store(self.config.max_streams, Ordering::Release);
        self.pid.lock().reset();
        info!(%reason, "governor entered safe mode");
        self.events.emit(EngineEvent::SafeModeEntered { reason });
    }

    pub fn exit_safe_mode(&self) {
        self.safe_mode.store(false, Ordering::Release);
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn adjust_limits(&self, delta: i64, min: Option<u64>, max: Option<u64>) {
        let min = min.unwrap_or(self.config.min_streams);
        let max = max.unwrap_or(self.config.max_streams);
        let current = self.current_cap() as i64;
        let next = (current + delta).clamp(min as i64, max as i64);
        self.cap.store(next as u64, Ordering::Release);
    }

    fn budget_for(&self, tenant_id: &TenantId) -> Option<TenantBudget> {
        self.config
            .tenant_budgets
            .get(tenant_id.as_str())
            .copied()
            .or(self.config.default_budget)
    }

    /// Admission decision for one new stream (spec.md §4.6).
    pub fn evaluate(&self, tenant_id: &TenantId) -> AdmissionDecision {
        if !self.config.enabled {
            return AdmissionDecision::Admit;
        }
        if self.is_safe_mode() {
            return AdmissionDecision::SafeMode;
        }

        if let Some(budget) = self.budget_for(tenant_id) {
            let now = self.clock.now();
            let mut usage = self.tenants.entry(tenant_id.clone()).or_default();

            if usage.current >= budget.hard_limit {
                return AdmissionDecision::Reject {
                    reason: format!("hard_limit_{}", budget.hard_limit),
                };
            }

            let window_expired = usage.burst_reset_at.map(|reset| now >= reset).unwrap_or(true);
            if window_expired {
                usage.burst_count = 0;
                usage.burst_reset_at = Some(now + budget.decay);
            }

            if usage.burst_count >= budget.burst_limit {
                return AdmissionDecision::Reject {
                    reason: format!("burst_limit_{}", budget.burst_limit),
                };
            }
            usage.burst_count += 1;
        }

        if self.active_streams() >= self.current_cap() {
            return AdmissionDecision::Queue {
                reason: format!("at_capacity_{}", self.current_cap()),
            };
        }

        if self.budget_for(tenant_id).is_some() {
            self.tenants.entry(tenant_id.clone()).or_default().current += 1;
        }
        self.active_streams.fetch_add(1, Ordering::AcqRel);
        AdmissionDecision::Admit
    }

    /// Releases one tenant's usage slot on stream termination.
    pub fn release_tenant(&self, tenant_id: &TenantId) {
        self.active_streams.fetch_sub(1, Ordering::AcqRel);
        if let Some(mut usage) = self.tenants.get_mut(tenant_id) {
            usage.current = usage.current.saturating_sub(1);
        }
    }
}
