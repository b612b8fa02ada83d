//! Fixtures shared by ledger, controller and vault tests.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) use super::empty_registry;
use super::{VaultCore, VaultEventKind, VaultLedger};
use crate::backend::{BackendSet, MockStrategy};
use crate::config::Config;
use crate::risk::{ImpairmentMonitor, MonitorConfig};
use crate::strategy::{NewStrategy, StrategyId};

/// Whole-unit amounts, 10% idle reserve, 100ms call timeout.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.vault.amount_scale = 0;
    config.vault.idle_buffer_ratio = dec!(0.10);
    config.allocation.max_single_allocation = dec!(10_000);
    config.execution.call_timeout_ms = 100;
    config
}

pub(crate) fn new_strategy(id: &str, risk: u32, current_yield: Decimal) -> NewStrategy {
    NewStrategy {
        id: StrategyId::new(id),
        backend: id.to_string(),
        protocol: "lending".to_string(),
        risk_score: risk,
        capacity: dec!(10_000),
        min_deposit: Decimal::ZERO,
        current_yield,
        liquidity_depth: dec!(1_000_000),
    }
}

/// The three-strategy set used throughout: `a` (10%, risk 2000), `b` (5%,
/// risk 1000) and `c` (15%, risk 6000, above the default ceiling).
pub(crate) fn sample_strategies() -> Vec<NewStrategy> {
    vec![
        new_strategy("a", 2000, dec!(0.10)),
        new_strategy("b", 1000, dec!(0.05)),
        new_strategy("c", 6000, dec!(0.15)),
    ]
}

pub(crate) fn sample_backends() -> (BackendSet, BTreeMap<String, Arc<MockStrategy>>) {
    let mut backends = BackendSet::new();
    let mut mocks = BTreeMap::new();
    for strategy in sample_strategies() {
        let mock = Arc::new(MockStrategy::new(strategy.current_yield, strategy.liquidity_depth));
        backends.insert(strategy.backend.clone(), mock.clone());
        mocks.insert(strategy.backend, mock);
    }
    (backends, mocks)
}

pub(crate) struct Harness {
    pub core: VaultCore,
    pub mocks: BTreeMap<String, Arc<MockStrategy>>,
}

/// A core with the sample strategies registered and nothing deposited.
pub(crate) fn harness() -> Harness {
    let config = test_config();
    let mut ledger = VaultLedger::new(empty_registry(&config), config.vault.amount_scale);
    for strategy in sample_strategies() {
        ledger
            .record(VaultEventKind::StrategyRegistered { strategy }, Utc::now())
            .unwrap();
    }
    let (backends, mocks) = sample_backends();
    let monitor = ImpairmentMonitor::new(MonitorConfig {
        max_consecutive_failures: config.risk.max_consecutive_failures,
        max_alerts: 100,
    });
    Harness {
        core: VaultCore::new(ledger, backends, monitor),
        mocks,
    }
}

/// Book a deposit straight into the ledger.
pub(crate) fn deposit(core: &mut VaultCore, depositor: &str, amount: Decimal) -> Decimal {
    let shares = core.ledger.preview_deposit(amount).unwrap();
    core.ledger
        .record(
            VaultEventKind::Deposited {
                depositor: depositor.to_string(),
                amount,
                shares,
            },
            Utc::now(),
        )
        .unwrap();
    shares
}
