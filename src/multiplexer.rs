//! C5 — Ops Multiplexer.
//!
//! Coalesces same-method, same-model requests that arrive within a short
//! hold window into one `batch_<method>` call (spec.md §4.5). Flush
//! timers are modeled as spawned tasks racing against manual flush calls,
//! the same pattern the teacher crate uses for its retry backoff timers
//! (`governance::retry::adaptive`) — a timer future plus a condition that
//! can short-circuit it.

use crate::error::{EngineError, EngineResult};
use crate::rpc::Correlator;
use crate::time::Clock;
use crate::transport::Transport;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub min_hold: Duration,
    pub max_hold: Duration,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            min_hold: Duration::from_millis(2),
            max_hold: Duration::from_millis(8),
            min_batch_size: 2,
            max_batch_size: 16,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MultiplexerStats {
    pub dispatched_batches: u64,
    pub batched_requests: u64,
    pub solo_requests: u64,
}

struct Entry {
    params: Value,
    resolver: oneshot::Sender<EngineResult<Value>>,
}

struct Group {
    entries: Vec<Entry>,
    min_hold_armed: bool,
    flush_generation: u64,
}

/// Keyed by (method, model id).
type GroupKey = (String, String);

pub struct Multiplexer {
    config: MultiplexerConfig,
    groups: Mutex<HashMap<GroupKey, Group>>,
    clock: Arc<dyn Clock>,
    stats: Mutex<MultiplexerStats>,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            config,
            groups: Mutex::new(HashMap::new()),
            clock,
            stats: Mutex::new(MultiplexerStats::default()),
        })
    }

    pub async fn stats(&self) -> MultiplexerStats {
        self.stats.lock().await.clone()
    }

    /// Submits one batchable request. Resolves once the group it joined
    /// is flushed (or immediately, if dispatched solo).
    pub async fn submit(
        self: &Arc<Self>,
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        method: &str,
        model_id: &str,
        params: Value,
        priority: Priority,
        timeout: Duration,
    ) -> EngineResult<Value> {
        let bypass = priority == Priority::High || timeout < self.config.min_hold;
        if bypass {
            self.stats.lock().await.solo_requests += 1;
            return correlator.request(&*transport, method, params, timeout).await;
        }

        let (tx, rx) = oneshot::channel();
        let key: GroupKey = (method.to_string(), model_id.to_string());
        let should_arm_min_hold;
        let should_arm_max_hold;
        let flush_now_for_size;
        let generation;
        {
            let mut groups = self.groups.lock().await;
            let group = groups.entry(key.clone()).or_insert_with(|| Group {
                entries: Vec::new(),
                min_hold_armed: false,
                flush_generation: 0,
            });
            let is_first = group.entries.is_empty();
            group.entries.push(Entry {
                params,
                resolver: tx,
            });
            should_arm_min_hold = is_first && !group.min_hold_armed;
            if should_arm_min_hold {
                group.min_hold_armed = true;
            }
            should_arm_max_hold = is_first;
            flush_now_for_size = group.entries.len() >= self.config.max_batch_size;
            generation = group.flush_generation;
        }

        if flush_now_for_size {
            self.flush(correlator.clone(), transport.clone(), key.clone(), generation).await;
        } else {
            if should_arm_max_hold {
                self.arm_timer(correlator.clone(), transport.clone(), key.clone(), self.config.max_hold, generation);
            }
            if should_arm_min_hold {
                self.arm_min_hold_timer(correlator.clone(), transport.clone(), key.clone(), generation);
            }
        }

        rx.await.unwrap_or(Err(EngineError::Cancelled))
    }

    fn arm_timer(
        self: &Arc<Self>,
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        key: GroupKey,
        delay: Duration,
        generation: u64,
    ) {
        let this = self.clone();
        let sleep = self.clock.sleep(delay);
        tokio::spawn(async move {
            sleep.await;
            this.flush(correlator, transport, key, generation).await;
        });
    }

    fn arm_min_hold_timer(
        self: &Arc<Self>,
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        key: GroupKey,
        generation: u64,
    ) {
        let this = self.clone();
        let min_hold = self.config.min_hold;
        let min_batch_size = self.config.min_batch_size;
        let sleep = self.clock.sleep(min_hold);
        tokio::spawn(async move {
            sleep.await;
            let ready = {
                let groups = this.groups.lock().await;
                groups
                    .get(&key)
                    .map(|g| g.flush_generation == generation && g.entries.len() >= min_batch_size)
                    .unwrap_or(false)
            };
            if ready {
                this.flush(correlator, transport, key, generation).await;
            }
        });
    }

    async fn flush(
        self: &Arc<Self>,
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        key: GroupKey,
        generation: u64,
    ) {
        let entries = {
            let mut groups = self.groups.lock().await;
            let Some(group) = groups.get_mut(&key) else {
                return;
            };
            if group.flush_generation != generation || group.entries.is_empty() {
                return;
            }
            group.flush_generation += 1;
            group.min_hold_armed = false;
            std::mem::take(&mut group.entries)
        };

        let count = entries.len();
        let (method, _model_id) = &key;
        let requests: Vec<Value> = entries.iter().map(|e| e.params.clone()).collect();
        let batch_method = format!("batch_{method}");

        let outcome = correlator
            .request(&*transport, &batch_method, json!({ "requests": requests }), Duration::from_secs(30))
            .await;

        {
            let mut stats = self.stats.lock().await;
            stats.dispatched_batches += 1;
            stats.batched_requests += count as u64;
        }

        match outcome {
            Ok(value) => {
                let results = value
                    .get("results")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default();
                for (i, entry) in entries.into_iter().enumerate() {
                    let slot = results.get(i);
                    let resolved = match slot {
                        Some(slot) if slot.get("success").and_then(|s| s.as_bool()) == Some(true) => {
                            Ok(slot.get("result").cloned().unwrap_or(Value::Null))
                        }
                        Some(slot) => Err(EngineError::GenerationError {
                            message: slot
                                .get("error")
                                .and_then(|e| e.as_str())
                                .unwrap_or("batched entry failed")
                                .to_string(),
                        }),
                        None => Err(EngineError::RuntimeError {
                            message: "batch reply missing slot for request".to_string(),
                        }),
                    };
                    let _ = entry.resolver.send(resolved);
                }
            }
            Err(error) => {
                for entry in entries {
                    let _ = entry.resolver.send(Err(EngineError::RuntimeError {
                        message: error.to_string(),
                    }));
                }
            }
        }
    }

    /// Fails every parked entry across all groups (spec.md §4.5 "group
    /// cleanup runs on transport change").
    pub async fn cancel_all(&self) {
        let mut groups = self.groups.lock().await;
        for (_, group) in groups.drain() {
            for entry in group.entries {
                let _ = entry.resolver.send(Err(EngineError::Cancelled));
            }
        }
    }
}
