//! C4 — Subprocess Supervisor.
//!
//! Owns the child process, the current [`Transport`], and the routing of
//! inbound wire messages to the [`Correlator`] (responses) and a
//! notification channel (everything else). Grounded on the teacher
//! crate's `arc_swap` usage for hot-swappable shared state: the current
//! transport is held in an `ArcSwapOption` so readers never block on a
//! restart in progress.

use crate::error::{EngineError, EngineResult};
use crate::protocol::InboundMessage;
use crate::rpc::Correlator;
use crate::time::{jitter_factor, Clock};
use crate::transport::{ChildTransport, Transport, TransportGeneration};
use arc_swap::ArcSwapOption;
use serde_json::json;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Ready,
    Stopped,
    Error,
}

impl SupervisorState {
    fn to_u8(self) -> u8 {
        match self {
            SupervisorState::Starting => 0,
            SupervisorState::Ready => 1,
            SupervisorState::Stopped => 2,
            SupervisorState::Error => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::Starting,
            1 => SupervisorState::Ready,
            2 => SupervisorState::Stopped,
            _ => SupervisorState::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub python_path: String,
    pub runtime_path: String,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_restarts: u32,
    pub restart_delay_base: Duration,
    /// Soft cap on a single inbound line from the child (spec.md §6
    /// `maxLineBufferBytes`), passed through to [`ChildTransport::spawn`].
    pub max_line_buffer_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            runtime_path: "runtime.py".to_string(),
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_restarts: 3,
            restart_delay_base: Duration::from_secs(1),
            max_line_buffer_bytes: crate::transport::DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorInfo {
    pub pid: Option<u32>,
    pub status: SupervisorState,
    pub uptime: Duration,
}

/// Raw notification forwarded from the child, keyed by method name, for
/// whatever component cares (stream registry, reconciler probes).
pub struct RawNotification {
    pub method: String,
    pub params: serde_json::Value,
}

pub struct Supervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    correlator: Arc<Correlator>,
    notifications_tx: mpsc::UnboundedSender<RawNotification>,
    transport: ArcSwapOption<dyn Transport>,
    state: AtomicU8,
    generation: AtomicU64,
    pid: AtomicU32,
    started_at: Mutex<Option<std::time::Instant>>,
    transport_watch_tx: watch::Sender<TransportGeneration>,
    pub transport_watch: watch::Receiver<TransportGeneration>,
    stopping: std::sync::atomic::AtomicBool,
    capabilities: parking_lot::RwLock<HashSet<String>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        correlator: Arc<Correlator>,
        notifications_tx: mpsc::UnboundedSender<RawNotification>,
    ) -> Arc<Self> {
        let (tx, rx) = watch::channel(TransportGeneration::initial());
        Arc::new(Self {
            config,
            clock,
            correlator,
            notifications_tx,
            transport: ArcSwapOption::from(None),
            state: AtomicU8::new(SupervisorState::Stopped.to_u8()),
            generation: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            started_at: Mutex::new(None),
            transport_watch_tx: tx,
            transport_watch: rx,
            stopping: std::sync::atomic::AtomicBool::new(false),
            capabilities: parking_lot::RwLock::new(HashSet::new()),
        })
    }

    /// Whether the currently-running child advertised `name` in its
    /// `runtime/info` capability list (spec.md §4.8 step 6, §9 "Capability
    /// detection"). Callers use this to decide whether an operation may be
    /// batched by the multiplexer at all.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.read().contains(name)
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn get_transport(&self) -> Option<Arc<dyn Transport>> {
        if self.state() != SupervisorState::Ready {
            return None;
        }
        self.transport.load_full()
    }

    pub async fn info(&self) -> SupervisorInfo {
        let pid = self.pid.load(Ordering::Acquire);
        let started_at = *self.started_at.lock().await;
        SupervisorInfo {
            pid: if pid == 0 { None } else { Some(pid) },
            status: self.state(),
            uptime: started_at.map(|t| self.clock.now().saturating_duration_since(t)).unwrap_or_default(),
        }
    }

    /// Start (or restart) the child, retrying up to `max_restarts` times
    /// with `restart_delay_base * attempt` backoff (spec.md §4.4), and on
    /// success spawns a watchdog that detects unexpected exit and
    /// re-enters this same bounded loop.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.stopping.store(false, Ordering::Release);
        self.set_state(SupervisorState::Starting);

        let mut last_err = EngineError::runtime("supervisor never attempted a spawn");
        for attempt in 1..=(self.config.max_restarts + 1) {
            match self.spawn_once().await {
                Ok(()) => {
                    self.set_state(SupervisorState::Ready);
                    *self.started_at.lock().await = Some(self.clock.now());
                    info!(attempt, "child ready");
                    return Ok(());
                }
                Err(error) => {
                    warn!(attempt, %error, "child spawn/probe failed");
                    last_err = error;
                    if attempt <= self.config.max_restarts {
                        let base = self.config.restart_delay_base * attempt;
                        let jitter = jitter_factor(attempt as u64 ^ base.as_nanos() as u64, 0.1);
                        let delay = Duration::from_secs_f64(base.as_secs_f64() * jitter);
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
        self.set_state(SupervisorState::Error);
        Err(last_err)
    }

    async fn spawn_once(&self) -> EngineResult<()> {
        let mut command = Command::new(&self.config.python_path);
        command
            .arg(&self.config.runtime_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::runtime(format!("failed to spawn child: {e}")))?;
        self.pid.store(child.id().unwrap_or(0), Ordering::Release);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::runtime("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::runtime("child stdout not piped"))?;
        let stderr = child.stderr.take();

        let generation = TransportGeneration::from_raw(self.generation.fetch_add(1, Ordering::AcqRel) + 1);
        let transport = ChildTransport::spawn(stdin, stdout, stderr, generation, self.config.max_line_buffer_bytes);

        let receiver = transport
            .take_receiver()
            .await
            .expect("freshly spawned transport owns its receiver");
        self.spawn_routing_task(receiver);

        let probe = self
            .correlator
            .request(&*transport, "runtime/info", json!({}), self.config.startup_timeout)
            .await;

        match probe {
            Ok(info) => {
                let capabilities: HashSet<String> = info
                    .get("capabilities")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect();
                *self.capabilities.write() = capabilities;
                self.transport.store(Some(transport as Arc<dyn Transport>));
                let _ = self.transport_watch_tx.send(generation);
                self.spawn_watchdog(child);
                Ok(())
            }
            Err(error) => {
                transport.close().await;
                let _ = child.kill().await;
                Err(error)
            }
        }
    }

    fn spawn_routing_task(&self, mut receiver: mpsc::UnboundedReceiver<InboundMessage>) {
        let correlator = self.correlator.clone();
        let notifications_tx = self.notifications_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    InboundMessage::Response { id, result, error } => {
                        correlator.resolve(id, result, error);
                    }
                    InboundMessage::Notification { method, params } => {
                        let _ = notifications_tx.send(RawNotification { method, params });
                    }
                }
            }
        });
    }

    fn spawn_watchdog(self: &Arc<Self>, mut child: tokio::process::Child) {
        let this = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            if this.stopping.load(Ordering::Acquire) {
                return;
            }
            warn!(?status, "child exited unexpectedly");
            this.set_state(SupervisorState::Error);
            this.correlator.cancel_all();
            if let Err(error) = this.start().await {
                error!(%error, "failed to recover child after unexpected exit");
            }
        });
    }

    /// Graceful shutdown: sends `shutdown`, waits up to `shutdown_timeout`,
    /// then relies on `kill_on_drop` to reclaim the process. Idempotent.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(transport) = self.transport.load_full() {
            let _ = self
                .correlator
                .request(&*transport, "shutdown", json!({}), self.config.shutdown_timeout)
                .await;
            transport.close().await;
        }
        self.transport.store(None);
        self.set_state(SupervisorState::Stopped);
    }
}
