//! Simulated strategy backend for paper runs and tests.

use super::{BackendMetrics, StrategyCapability};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Simulated backend state.
#[derive(Debug, Clone)]
pub struct MockStrategyState {
    /// Marked value held, including unharvested yield
    pub balance: Decimal,
    /// Yield accrued since the last harvest
    pub pending_yield: Decimal,
    pub apy: Decimal,
    pub liquidity_depth: Decimal,
}

/// Injected failure modes.
#[derive(Debug, Default)]
struct FailureFlags {
    deploy: AtomicBool,
    withdraw: AtomicBool,
    harvest: AtomicBool,
    exit: AtomicBool,
    balance: AtomicBool,
    metrics: AtomicBool,
}

/// In-memory backend with failure and latency injection.
pub struct MockStrategy {
    state: Arc<RwLock<MockStrategyState>>,
    failures: FailureFlags,
    /// Artificial latency applied to every call, in milliseconds
    latency_ms: AtomicU64,
    /// Fraction of the balance an emergency exit recovers, in basis points
    exit_recovery_bps: AtomicU64,
    exit_calls: AtomicU64,
    withdraw_calls: AtomicU64,
}

impl MockStrategy {
    /// Create a mock backend with the given yield and market depth.
    pub fn new(apy: Decimal, liquidity_depth: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockStrategyState {
                balance: Decimal::ZERO,
                pending_yield: Decimal::ZERO,
                apy,
                liquidity_depth,
            })),
            failures: FailureFlags::default(),
            latency_ms: AtomicU64::new(0),
            exit_recovery_bps: AtomicU64::new(10_000),
            exit_calls: AtomicU64::new(0),
            withdraw_calls: AtomicU64::new(0),
        }
    }

    pub fn fail_deploy(&self, fail: bool) {
        self.failures.deploy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_withdraw(&self, fail: bool) {
        self.failures.withdraw.store(fail, Ordering::SeqCst);
    }

    pub fn fail_harvest(&self, fail: bool) {
        self.failures.harvest.store(fail, Ordering::SeqCst);
    }

    pub fn fail_exit(&self, fail: bool) {
        self.failures.exit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_balance(&self, fail: bool) {
        self.failures.balance.store(fail, Ordering::SeqCst);
    }

    pub fn fail_metrics(&self, fail: bool) {
        self.failures.metrics.store(fail, Ordering::SeqCst);
    }

    /// Fail every call.
    pub fn fail_all(&self, fail: bool) {
        self.fail_deploy(fail);
        self.fail_withdraw(fail);
        self.fail_harvest(fail);
        self.fail_exit(fail);
        self.fail_balance(fail);
        self.fail_metrics(fail);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Recover only part of the balance on emergency exit (10000 = all).
    pub fn set_exit_recovery_bps(&self, bps: u64) {
        self.exit_recovery_bps.store(bps.min(10_000), Ordering::SeqCst);
    }

    /// Accrue yield on top of the deployed balance.
    pub async fn accrue(&self, amount: Decimal) {
        let mut state = self.state.write().await;
        state.balance += amount;
        state.pending_yield += amount;
    }

    /// Update simulated yield and depth.
    pub async fn set_market(&self, apy: Decimal, liquidity_depth: Decimal) {
        let mut state = self.state.write().await;
        state.apy = apy;
        state.liquidity_depth = liquidity_depth;
    }

    /// Snapshot of the simulated state.
    pub async fn get_state(&self) -> MockStrategyState {
        self.state.read().await.clone()
    }

    pub fn exit_calls(&self) -> u64 {
        self.exit_calls.load(Ordering::SeqCst)
    }

    pub fn withdraw_calls(&self) -> u64 {
        self.withdraw_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl StrategyCapability for MockStrategy {
    async fn deploy(&self, amount: Decimal) -> Result<()> {
        self.simulate_latency().await;
        if self.failures.deploy.load(Ordering::SeqCst) {
            bail!("deploy rejected: protocol paused");
        }
        if amount <= Decimal::ZERO {
            bail!("deploy amount must be positive, got {}", amount);
        }

        let mut state = self.state.write().await;
        state.balance += amount;
        debug!(%amount, balance = %state.balance, "Mock deploy");
        Ok(())
    }

    async fn withdraw(&self, amount: Decimal) -> Result<Decimal> {
        self.withdraw_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failures.withdraw.load(Ordering::SeqCst) {
            bail!("withdraw rejected: insufficient market liquidity");
        }

        let mut state = self.state.write().await;
        let released = amount.min(state.balance).max(Decimal::ZERO);
        state.balance -= released;
        state.pending_yield = state.pending_yield.min(state.balance);
        debug!(%amount, %released, balance = %state.balance, "Mock withdraw");
        Ok(released)
    }

    async fn harvest(&self) -> Result<Decimal> {
        self.simulate_latency().await;
        if self.failures.harvest.load(Ordering::SeqCst) {
            bail!("harvest reverted");
        }

        let mut state = self.state.write().await;
        let realized = state.pending_yield;
        state.balance -= realized;
        state.pending_yield = Decimal::ZERO;
        Ok(realized)
    }

    async fn emergency_exit(&self) -> Result<Decimal> {
        self.exit_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failures.exit.load(Ordering::SeqCst) {
            bail!("emergency exit reverted");
        }

        let bps = Decimal::from(self.exit_recovery_bps.load(Ordering::SeqCst));
        let mut state = self.state.write().await;
        let recovered = state.balance * bps / Decimal::from(10_000);
        state.balance -= recovered;
        state.pending_yield = state.pending_yield.min(state.balance);
        Ok(recovered)
    }

    async fn get_balance(&self) -> Result<Decimal> {
        self.simulate_latency().await;
        if self.failures.balance.load(Ordering::SeqCst) {
            bail!("balance query timed out upstream");
        }
        Ok(self.state.read().await.balance)
    }

    async fn metrics(&self) -> Result<BackendMetrics> {
        self.simulate_latency().await;
        if self.failures.metrics.load(Ordering::SeqCst) {
            bail!("metrics endpoint unavailable");
        }
        let state = self.state.read().await;
        Ok(BackendMetrics::new(state.apy, state.liquidity_depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_deploy_and_withdraw() {
        let mock = MockStrategy::new(dec!(0.05), dec!(1_000_000));
        mock.deploy(dec!(500)).await.unwrap();
        assert_eq!(mock.get_balance().await.unwrap(), dec!(500));

        let released = mock.withdraw(dec!(200)).await.unwrap();
        assert_eq!(released, dec!(200));
        assert_eq!(mock.get_balance().await.unwrap(), dec!(300));

        // Cannot release more than held
        let released = mock.withdraw(dec!(1000)).await.unwrap();
        assert_eq!(released, dec!(300));
        assert_eq!(mock.withdraw_calls(), 2);
    }

    #[tokio::test]
    async fn test_harvest_is_idempotent() {
        let mock = MockStrategy::new(dec!(0.05), dec!(1_000_000));
        mock.deploy(dec!(1000)).await.unwrap();
        mock.accrue(dec!(12)).await;

        assert_eq!(mock.harvest().await.unwrap(), dec!(12));
        assert_eq!(mock.harvest().await.unwrap(), Decimal::ZERO);
        assert_eq!(mock.get_balance().await.unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn test_partial_emergency_exit() {
        let mock = MockStrategy::new(dec!(0.05), dec!(1_000_000));
        mock.deploy(dec!(1000)).await.unwrap();
        mock.set_exit_recovery_bps(6000);

        assert_eq!(mock.emergency_exit().await.unwrap(), dec!(600));
        assert_eq!(mock.get_state().await.balance, dec!(400));
        assert_eq!(mock.exit_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mock = MockStrategy::new(dec!(0.05), dec!(1_000_000));
        mock.fail_all(true);
        assert!(mock.deploy(dec!(1)).await.is_err());
        assert!(mock.withdraw(dec!(1)).await.is_err());
        assert!(mock.emergency_exit().await.is_err());
        assert!(mock.metrics().await.is_err());

        mock.fail_all(false);
        assert_eq!(
            mock.metrics().await.unwrap(),
            BackendMetrics::new(dec!(0.05), dec!(1_000_000))
        );
    }
}
