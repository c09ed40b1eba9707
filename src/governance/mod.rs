//! Governance: the PID-controlled admission governor (C6) and the
//! reconciliation circuit breaker (C7).

pub mod breaker;
pub mod governor;
pub mod pid;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use governor::{AdmissionDecision, Governor, GovernorConfig, TenantBudget};
pub use pid::{PidGains, PidState};
