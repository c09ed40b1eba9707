//! C1 — Framed Transport.
//!
//! Carries one JSON object per line over the child subprocess's stdio,
//! grounded on `spark-transport-tcp::channel::TcpChannel`'s shape (an
//! `AsyncMutex`-guarded writer, a background reader task, explicit
//! size caps) but over `tokio::process::Child` stdio instead of a TCP
//! socket, since spec.md §4.1 names stdin/stdout as the duplex channel.

use crate::error::{EngineError, EngineResult};
use crate::protocol::{parse_line, InboundMessage, WireNotification, WireRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifies one transport instance across the supervisor's restart
/// cycles. Consumers that cache per-transport state (multiplexer groups,
/// stream listeners) compare this to detect a restart (spec.md §4.4 "all
/// consumers observing the transport identity must treat the previous one
/// as dead").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportGeneration(u64);

impl TransportGeneration {
    pub const fn initial() -> Self {
        Self(0)
    }

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Default soft cap on a single inbound line (spec.md §4.1, §6
/// `maxLineBufferBytes`); overridden per-supervisor from `EngineOptions`.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
/// Cap on a single outbound message (spec.md §4.1 "write-buffer cap").
pub const MAX_WRITE_BYTES: usize = 1024 * 1024;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request(&self, request: &WireRequest) -> EngineResult<()>;
    async fn send_notification(&self, notification: &WireNotification) -> EngineResult<()>;
    /// Idempotent. Flushes the writer, aborts the reader task.
    async fn close(&self);
    fn generation(&self) -> TransportGeneration;
    fn is_closed(&self) -> bool;
}

/// Transport over a spawned child process's stdio.
pub struct ChildTransport {
    stdin: Mutex<ChildStdin>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    closed: AtomicBool,
    generation: TransportGeneration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChildTransport {
    /// `max_line_bytes` bounds a single inbound line (spec.md §6
    /// `maxLineBufferBytes`); exceeding it closes the transport the same
    /// way an unparseable line does.
    pub fn spawn(
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        generation: TransportGeneration,
        max_line_bytes: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(stdout, tx, max_line_bytes));
        let stderr_task = stderr.map(|stderr| tokio::spawn(drain_stderr(stderr)));

        Arc::new(Self {
            stdin: Mutex::new(stdin),
            inbound_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            generation,
            reader_task: Mutex::new(Some(reader_task)),
            stderr_task: Mutex::new(stderr_task),
        })
    }

    /// Takes ownership of the inbound message stream; may only be called
    /// once per transport instance (the single routing loop owns it).
    pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound_rx.lock().await.take()
    }

    async fn write_line(&self, line: String) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::transport("transport already closed"));
        }
        if line.len() > MAX_WRITE_BYTES {
            return Err(EngineError::transport(format!(
                "outbound message of {} bytes exceeds {}-byte cap",
                line.len(),
                MAX_WRITE_BYTES
            )));
        }
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::transport(format!("write failed: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| EngineError::transport(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::transport(format!("flush failed: {e}")))
    }
}

#[async_trait]
impl Transport for ChildTransport {
    async fn send_request(&self, request: &WireRequest) -> EngineResult<()> {
        let line = serde_json::to_string(request)
            .map_err(|e| EngineError::transport(format!("encode failed: {e}")))?;
        self.write_line(line).await
    }

    async fn send_notification(&self, notification: &WireNotification) -> EngineResult<()> {
        let line = serde_json::to_string(notification)
            .map_err(|e| EngineError::transport(format!("encode failed: {e}")))?;
        self.write_line(line).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_task.lock().await.take() {
            handle.abort();
        }
        let mut stdin = self.stdin.lock().await;
        let _ = stdin.shutdown().await;
    }

    fn generation(&self) -> TransportGeneration {
        self.generation
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn read_loop(stdout: ChildStdout, tx: mpsc::UnboundedSender<InboundMessage>, max_line_bytes: usize) {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("child stdout closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.len() > max_line_bytes {
                    warn!(len = trimmed.len(), max_line_bytes, "inbound line exceeds cap, closing transport");
                    break;
                }
                match parse_line(trimmed) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "unparseable line from child, closing transport");
                        break;
                    }
                }
            }
            Err(error) => {
                warn!(%error, "read error on child stdout");
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    debug!(child_stderr = trimmed, "child stderr");
                }
            }
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use tokio::sync::mpsc::UnboundedSender;

    /// In-process stand-in for a child process, used by governor/breaker/
    /// reconciler tests and the end-to-end scenarios in spec.md §8.
    pub struct MockTransport {
        sent_requests: Mutex<Vec<WireRequest>>,
        sent_notifications: Mutex<Vec<WireNotification>>,
        inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
        inbound_tx: UnboundedSender<InboundMessage>,
        closed: AtomicBool,
        generation: TransportGeneration,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        pub fn new(generation: TransportGeneration) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent_requests: Mutex::new(Vec::new()),
                sent_notifications: Mutex::new(Vec::new()),
                inbound_rx: Mutex::new(Some(rx)),
                inbound_tx: tx,
                closed: AtomicBool::new(false),
                generation,
                fail_sends: AtomicBool::new(false),
            })
        }

        pub fn push_inbound(&self, message: InboundMessage) {
            let _ = self.inbound_tx.send(message);
        }

        pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
            self.inbound_rx.lock().await.take()
        }

        pub async fn sent_requests(&self) -> Vec<WireRequest> {
            self.sent_requests.lock().await.clone()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_request(&self, request: &WireRequest) -> EngineResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(EngineError::transport("mock transport send failure"));
            }
            self.sent_requests.lock().await.push(request.clone());
            Ok(())
        }

        async fn send_notification(&self, notification: &WireNotification) -> EngineResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(EngineError::transport("mock transport send failure"));
            }
            self.sent_notifications.lock().await.push(notification.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn generation(&self) -> TransportGeneration {
            self.generation
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
