//! Dispatcher core for a local inference-serving middleware.
//!
//! Supervises a single Python inference runtime as a child process,
//! speaking newline-delimited JSON over its stdio, and exposes one
//! async facade ([`facade::Engine`]) covering model lifecycle,
//! streaming generation, batched tokenization, adaptive admission
//! control and crash reconciliation.
//!
//! ```text
//! facade::Engine
//!   ├── supervisor::Supervisor   (C4: child lifecycle, restart)
//!   │     └── transport::ChildTransport (C1: framed stdio)
//!   ├── rpc::Correlator          (C2: request/response matching)
//!   ├── stream_registry::StreamRegistry (C3: streaming state machine)
//!   ├── multiplexer::Multiplexer (C5: request batching)
//!   ├── governance::Governor     (C6: PID admission control)
//!   ├── governance::CircuitBreaker (C7: reconciliation guard)
//!   └── reconcile::Reconciler    (C8: post-restart state repair)
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod governance;
pub mod ids;
pub mod model;
pub mod multiplexer;
pub mod normalize;
pub mod protocol;
pub mod reconcile;
pub mod rpc;
pub mod stream_registry;
pub mod supervisor;
pub mod time;
pub mod transport;

pub use config::{EngineOptions, EngineOptionsRaw};
pub use error::{EngineError, EngineResult, WireError};
pub use facade::{CacheStats, Engine, HealthStatus};
pub use ids::{ModelId, RequestId, StreamId, TenantId};
