//! Explicit configuration struct (spec.md §6, §9 "Global config singleton
//! → explicit `EngineOptions` struct"). No process-wide mutable state: the
//! facade constructor takes one `EngineOptions` by value.

use crate::governance::{BreakerConfig, GovernorConfig, TenantBudget};
use crate::multiplexer::MultiplexerConfig;
use crate::stream_registry::StreamRegistryConfig;
use crate::supervisor::SupervisorConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptionsRaw {
    pub python_path: String,
    pub runtime_path: String,
    pub cache_dir: Option<String>,

    pub max_pending_requests: usize,
    pub max_line_buffer_bytes: usize,
    pub stream_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_base_ms: u64,

    pub min_hold_ms: u64,
    pub max_hold_ms: u64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,

    pub governor_enabled: bool,
    pub target_ttft_ms: f64,
    pub min_concurrent_streams: u64,
    pub max_concurrent_streams: u64,
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,
    pub sample_interval_ms: u64,
    pub tenant_budgets: HashMap<String, TenantBudgetRaw>,

    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub half_open_success_threshold: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TenantBudgetRaw {
    pub hard_limit: u64,
    pub burst_limit: u64,
    pub decay_ms: u64,
}

impl Default for EngineOptionsRaw {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            runtime_path: "runtime.py".to_string(),
            cache_dir: None,
            max_pending_requests: 100,
            max_line_buffer_bytes: 64 * 1024,
            stream_timeout_ms: 300_000,
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            max_restarts: 3,
            restart_delay_base_ms: 1_000,
            min_hold_ms: 2,
            max_hold_ms: 8,
            min_batch_size: 2,
            max_batch_size: 16,
            governor_enabled: true,
            target_ttft_ms: 200.0,
            min_concurrent_streams: 1,
            max_concurrent_streams: 32,
            pid_kp: 0.5,
            pid_ki: 0.05,
            pid_kd: 0.02,
            sample_interval_ms: 1_000,
            tenant_budgets: HashMap::new(),
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
            half_open_success_threshold: 1,
        }
    }
}

/// The engine's fully-resolved configuration, split into the sub-configs
/// each component actually owns.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_dir: Option<String>,
    /// Cap on outstanding RPCs (spec.md §6 `maxPendingRequests`), passed to
    /// [`crate::rpc::Correlator::with_max_pending`].
    pub max_pending_requests: usize,
    pub supervisor: SupervisorConfig,
    pub multiplexer: MultiplexerConfig,
    pub governor: GovernorConfig,
    pub breaker: BreakerConfig,
    pub stream_registry: StreamRegistryConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptionsRaw::default().into()
    }
}

impl From<EngineOptionsRaw> for EngineOptions {
    fn from(raw: EngineOptionsRaw) -> Self {
        let tenant_budgets = raw
            .tenant_budgets
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    TenantBudget {
                        hard_limit: v.hard_limit,
                        burst_limit: v.burst_limit,
                        decay: Duration::from_millis(v.decay_ms),
                    },
                )
            })
            .collect();

        Self {
            cache_dir: raw.cache_dir.clone(),
            max_pending_requests: raw.max_pending_requests,
            supervisor: SupervisorConfig {
                python_path: raw.python_path.clone(),
                runtime_path: raw.runtime_path.clone(),
                startup_timeout: Duration::from_millis(raw.startup_timeout_ms),
                shutdown_timeout: Duration::from_millis(raw.shutdown_timeout_ms),
                max_restarts: raw.max_restarts,
                restart_delay_base: Duration::from_millis(raw.restart_delay_base_ms),
                max_line_buffer_bytes: raw.max_line_buffer_bytes,
            },
            multiplexer: MultiplexerConfig {
                min_hold: Duration::from_millis(raw.min_hold_ms),
                max_hold: Duration::from_millis(raw.max_hold_ms),
                min_batch_size: raw.min_batch_size,
                max_batch_size: raw.max_batch_size,
            },
            governor: GovernorConfig {
                enabled: raw.governor_enabled,
                target_ttft_ms: raw.target_ttft_ms,
                min_streams: raw.min_concurrent_streams,
                max_streams: raw.max_concurrent_streams,
                gains: crate::governance::PidGains {
                    kp: raw.pid_kp,
                    ki: raw.pid_ki,
                    kd: raw.pid_kd,
                },
                sample_interval: Duration::from_millis(raw.sample_interval_ms),
                default_budget: tenant_budgets.get("default").copied(),
                tenant_budgets,
            },
            breaker: BreakerConfig {
                failure_threshold: raw.failure_threshold,
                recovery_timeout: Duration::from_millis(raw.recovery_timeout_ms),
                half_open_max_calls: raw.half_open_max_calls,
                half_open_success_threshold: raw.half_open_success_threshold,
            },
            stream_registry: StreamRegistryConfig {
                backpressure_threshold: crate::stream_registry::DEFAULT_BACKPRESSURE_THRESHOLD,
                stream_timeout: Duration::from_millis(raw.stream_timeout_ms),
            },
        }
    }
}

impl EngineOptions {
    /// Loads an optional TOML file, then overlays `ENGINE_`-prefixed
    /// environment variables (spec.md §9 "Global config singleton"): the
    /// minimum layered-source model this crate needs, modeled on the
    /// teacher's `configuration::source` priority-ordered layering.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, crate::error::EngineError> {
        let mut raw = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| crate::error::EngineError::runtime(format!("reading config: {e}")))?;
                toml::from_str(&text)
                    .map_err(|e| crate::error::EngineError::runtime(format!("parsing config: {e}")))?
            }
            None => EngineOptionsRaw::default(),
        };

        if let Ok(value) = std::env::var("ENGINE_PYTHON_PATH") {
            raw.python_path = value;
        }
        if let Ok(value) = std::env::var("ENGINE_RUNTIME_PATH") {
            raw.runtime_path = value;
        }
        if let Ok(value) = std::env::var("ENGINE_CACHE_DIR") {
            raw.cache_dir = Some(value);
        }

        Ok(raw.into())
    }
}
