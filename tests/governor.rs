//! P3/P6: tenant admission budgets are respected, and the PID sampler
//! keeps the concurrency cap within [min_streams, max_streams].

use engine_core::events::EventBus;
use engine_core::governance::{AdmissionDecision, Governor, GovernorConfig, PidGains, TenantBudget};
use engine_core::ids::TenantId;
use engine_core::time::MockClock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config_with_budget(hard_limit: u64, burst_limit: u64) -> GovernorConfig {
    let mut tenant_budgets = HashMap::new();
    tenant_budgets.insert(
        "tenant-a".to_string(),
        TenantBudget {
            hard_limit,
            burst_limit,
            decay: Duration::from_secs(10),
        },
    );
    GovernorConfig {
        enabled: true,
        target_ttft_ms: 200.0,
        min_streams: 1,
        max_streams: 32,
        gains: PidGains::default(),
        sample_interval: Duration::from_secs(1),
        default_budget: None,
        tenant_budgets,
    }
}

#[test]
fn rejects_once_hard_limit_is_reached() {
    let clock = Arc::new(MockClock::new());
    let governor = Governor::new(config_with_budget(2, 10), clock, EventBus::new());
    let tenant = TenantId::new("tenant-a");

    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
    assert!(matches!(governor.evaluate(&tenant), AdmissionDecision::Reject { .. }));
}

#[test]
fn burst_window_resets_after_decay() {
    let clock = Arc::new(MockClock::new());
    let governor = Governor::new(config_with_budget(100, 1), clock.clone(), EventBus::new());
    let tenant = TenantId::new("tenant-a");

    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
    assert!(matches!(governor.evaluate(&tenant), AdmissionDecision::Reject { .. }));

    clock.advance(Duration::from_secs(11));
    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
}

#[test]
fn release_tenant_frees_the_active_slot() {
    let clock = Arc::new(MockClock::new());
    let governor = Governor::new(config_with_budget(1, 10), clock, EventBus::new());
    let tenant = TenantId::new("tenant-a");

    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
    assert!(matches!(governor.evaluate(&tenant), AdmissionDecision::Reject { .. }));

    governor.release_tenant(&tenant);
    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
}

#[test]
fn safe_mode_rejects_everything_until_exited() {
    let clock = Arc::new(MockClock::new());
    let governor = Governor::new(GovernorConfig::default(), clock, EventBus::new());
    let tenant = TenantId::new("anyone");

    governor.enter_safe_mode("test");
    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::SafeMode);

    governor.exit_safe_mode();
    assert_eq!(governor.evaluate(&tenant), AdmissionDecision::Admit);
}

#[test]
fn sample_keeps_cap_within_configured_bounds() {
    let clock = Arc::new(MockClock::new());
    let mut config = GovernorConfig::default();
    config.min_streams = 1;
    config.max_streams = 32;
    let governor = Governor::new(config, clock, EventBus::new());

    for _ in 0..50 {
        governor.sample(900.0); // far above target -> push cap down
        assert!(governor.current_cap() >= 1 && governor.current_cap() <= 32);
    }
    for _ in 0..50 {
        governor.sample(10.0); // far below target -> push cap up
        assert!(governor.current_cap() >= 1 && governor.current_cap() <= 32);
    }
}
