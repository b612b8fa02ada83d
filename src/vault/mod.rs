//! Pooled vault: depositor API, operator controls and the single-writer core.
//!
//! Every operation takes the core lock for its whole duration, so deposits,
//! withdrawals, rebalances, ticks and emergency exits are atomic with
//! respect to each other. Rebalance, tick and emergency operations also take
//! the maintenance flag; a second one started while another is in flight is
//! rejected with `RebalanceInProgress`.

mod events;
mod inner;
mod ledger;
mod maintenance;
mod state;
#[cfg(test)]
pub(crate) mod test_support;

pub use events::{VaultEvent, VaultEventKind};
pub use inner::VaultCore;
pub use ledger::VaultLedger;
pub use maintenance::TickReport;
pub use state::{Position, StrategyAllocation, VaultMetrics, VaultState};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{guarded, BackendSet, CallOutcome, FundsRail, StrategyCapability};
use crate::config::Config;
use crate::error::{VaultError, VaultResult};
use crate::persistence::EventStore;
use crate::risk::{ImpairmentMonitor, MonitorConfig, RiskOracle, VaultAlert};
use crate::strategy::{
    EmergencyController, EmergencyReport, ExitOutcome, NewStrategy, RebalanceController,
    RebalanceReport, StrategyId, StrategyRegistry, StrategyStatus,
};
use crate::utils::decimal::floor_to_scale;

/// Clears the maintenance flag when dropped.
struct MaintenanceGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The vault.
pub struct Vault {
    config: Config,
    core: Mutex<VaultCore>,
    maintenance: AtomicBool,
    rebalancer: RebalanceController,
    emergency: EmergencyController,
    oracle: Arc<dyn RiskOracle>,
    rail: Arc<dyn FundsRail>,
    store: Option<StdMutex<EventStore>>,
}

impl Vault {
    /// Create an empty vault.
    pub fn new(
        config: Config,
        backends: BackendSet,
        oracle: Arc<dyn RiskOracle>,
        rail: Arc<dyn FundsRail>,
    ) -> Self {
        let ledger = VaultLedger::new(empty_registry(&config), config.vault.amount_scale);
        Self::from_ledger(config, ledger, backends, oracle, rail)
    }

    /// Rebuild a vault from its event history. New events are appended to
    /// the same store.
    pub fn restore(
        config: Config,
        backends: BackendSet,
        oracle: Arc<dyn RiskOracle>,
        rail: Arc<dyn FundsRail>,
        store: EventStore,
    ) -> anyhow::Result<Self> {
        let events = store.load_events()?;
        let count = events.len();
        let mut ledger =
            VaultLedger::replay(empty_registry(&config), config.vault.amount_scale, events)
                .context("Failed to replay event history")?;
        ledger
            .check_invariants()
            .context("Replayed ledger is inconsistent")?;

        let over_cap = ledger.over_cap();
        if !over_cap.is_empty() {
            warn!(strategies = ?over_cap, "Allocations above the configured cap, rebalance due");
            if !ledger.state().rebalance_due {
                ledger
                    .record(VaultEventKind::RebalanceDue, Utc::now())
                    .context("Failed to flag over-cap allocations")?;
            }
        }

        info!(events = count, "Vault restored from event store");
        let mut vault = Self::from_ledger(config, ledger, backends, oracle, rail);
        vault.store = Some(StdMutex::new(store));
        Ok(vault)
    }

    /// Persist events to `store`, which must be empty.
    pub fn with_store(mut self, store: EventStore) -> Self {
        self.store = Some(StdMutex::new(store));
        self
    }

    fn from_ledger(
        config: Config,
        ledger: VaultLedger,
        backends: BackendSet,
        oracle: Arc<dyn RiskOracle>,
        rail: Arc<dyn FundsRail>,
    ) -> Self {
        let monitor = ImpairmentMonitor::new(MonitorConfig {
            max_consecutive_failures: config.risk.max_consecutive_failures,
            ..Default::default()
        });
        Self {
            rebalancer: RebalanceController::new(&config),
            emergency: EmergencyController::new(&config),
            core: Mutex::new(VaultCore::new(ledger, backends, monitor)),
            maintenance: AtomicBool::new(false),
            oracle,
            rail,
            store: None,
            config,
        }
    }

    // ==================== Depositor API ====================

    /// Deposit base asset for `receiver`. Returns the shares minted.
    pub async fn deposit(&self, amount: Decimal, receiver: &str) -> VaultResult<Decimal> {
        let asset = self.config.vault.base_asset.clone();
        self.deposit_asset(&asset, amount, receiver).await
    }

    /// Deposit `asset`; only the configured base asset is accepted.
    pub async fn deposit_asset(
        &self,
        asset: &str,
        amount: Decimal,
        receiver: &str,
    ) -> VaultResult<Decimal> {
        let vault_config = &self.config.vault;
        if !asset.eq_ignore_ascii_case(&vault_config.base_asset) {
            return Err(VaultError::AssetNotAccepted(asset.to_string()));
        }
        if amount <= Decimal::ZERO || floor_to_scale(amount, vault_config.amount_scale) != amount {
            return Err(VaultError::InvalidAmount(amount));
        }
        if amount < vault_config.min_deposit {
            return Err(VaultError::BelowMinimum {
                amount,
                minimum: vault_config.min_deposit,
            });
        }
        if amount > vault_config.max_deposit {
            return Err(VaultError::AboveMaximum {
                amount,
                maximum: vault_config.max_deposit,
            });
        }

        let now = Utc::now();
        let mut core = self.core.lock().await;
        let state = core.ledger.state();
        if state.halted {
            return Err(VaultError::Halted);
        }
        if state.emergency {
            return Err(VaultError::EmergencyActive);
        }
        if state.paused {
            return Err(VaultError::RouterInactive);
        }
        let shares = core.ledger.preview_deposit(amount)?;
        if shares <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount(amount));
        }

        let result = self.deposit_locked(&mut core, receiver, amount, shares, now).await;
        self.finish(&mut core, result, now).await
    }

    async fn deposit_locked(
        &self,
        core: &mut VaultCore,
        receiver: &str,
        amount: Decimal,
        shares: Decimal,
        now: DateTime<Utc>,
    ) -> VaultResult<Decimal> {
        let accepted = match guarded(self.call_timeout(), self.rail.accept_up_to(amount)).await {
            CallOutcome::Ok(accepted) => accepted,
            failed => return Err(VaultError::RailFailure(failed.to_string())),
        };
        core.custody += accepted;
        if accepted < amount {
            warn!(%amount, %accepted, "Funds rail took a partial deposit, returning it");
            let floor = core.custody - accepted;
            if let CallOutcome::Ok(returned) =
                guarded(self.call_timeout(), self.rail.withdraw_up_to(accepted, floor)).await
            {
                core.custody -= returned;
            }
            return Err(VaultError::CapacityExceeded(format!(
                "funds rail accepted {} of {}",
                accepted, amount
            )));
        }

        core.ledger.record(
            VaultEventKind::Deposited {
                depositor: receiver.to_string(),
                amount,
                shares,
            },
            now,
        )?;
        info!(receiver, %amount, %shares, "Deposit");

        if self.config.vault.auto_deploy_on_deposit
            && self.rebalancer.deposit_drift(core.ledger.state())
        {
            match self.rebalancer.deploy_incremental(core, now).await {
                Ok(report) => debug!(deployed = %report.deployed, "Deployed deposit drift"),
                Err(e) => warn!(error = %e, "Deposit drift deployment failed"),
            }
        }
        Ok(shares)
    }

    /// Redeem `shares` held by `receiver`. Returns the assets paid.
    ///
    /// If idle capital is short the difference is pulled from strategies
    /// first. When that fails no shares are burned.
    pub async fn withdraw(&self, shares: Decimal, receiver: &str) -> VaultResult<Decimal> {
        if shares <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount(shares));
        }

        let now = Utc::now();
        let mut core = self.core.lock().await;
        if core.ledger.state().halted {
            return Err(VaultError::Halted);
        }
        let held = core.ledger.position_shares(receiver);
        if shares > held {
            return Err(VaultError::InsufficientShares {
                requested: shares,
                available: held,
            });
        }
        let assets = core.ledger.preview_redeem(shares)?;
        if assets <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount(shares));
        }

        let result = self
            .withdraw_locked(&mut core, receiver, shares, assets, now)
            .await;
        self.finish(&mut core, result, now).await
    }

    async fn withdraw_locked(
        &self,
        core: &mut VaultCore,
        receiver: &str,
        shares: Decimal,
        assets: Decimal,
        now: DateTime<Utc>,
    ) -> VaultResult<Decimal> {
        let idle = core.ledger.state().idle;
        if assets > idle {
            let recalled = self
                .rebalancer
                .withdraw_proportional(core, assets - idle, now)
                .await;
            self.sync_custody(core).await;
            if let Err(e) = recalled {
                warn!(receiver, %shares, %assets, error = %e, "Withdrawal rejected, shares kept");
                return Err(match e {
                    VaultError::InsufficientLiquidity { .. } => VaultError::InsufficientLiquidity {
                        needed: assets,
                        available: core.ledger.state().idle,
                    },
                    other => other,
                });
            }
        }

        let floor = (core.custody - assets).max(Decimal::ZERO);
        let paid = match guarded(self.call_timeout(), self.rail.withdraw_up_to(assets, floor)).await
        {
            CallOutcome::Ok(paid) => paid,
            failed => return Err(VaultError::RailFailure(failed.to_string())),
        };
        core.custody -= paid;
        if paid < assets {
            if let CallOutcome::Ok(back) =
                guarded(self.call_timeout(), self.rail.accept_up_to(paid)).await
            {
                core.custody += back;
            }
            return Err(VaultError::InsufficientLiquidity {
                needed: assets,
                available: paid,
            });
        }

        core.ledger.record(
            VaultEventKind::Withdrawn {
                depositor: receiver.to_string(),
                shares,
                assets,
            },
            now,
        )?;
        info!(receiver, %shares, %assets, "Withdrawal");

        let state = core.ledger.state();
        if !state.rebalance_due && self.rebalancer.withdraw_drift(state) {
            core.ledger.record(VaultEventKind::RebalanceDue, now)?;
            debug!("Idle drained below target, rebalance due");
        }
        Ok(assets)
    }

    /// Current position of `depositor`.
    pub async fn position(&self, depositor: &str) -> Option<Position> {
        self.core.lock().await.ledger.position(depositor).cloned()
    }

    pub async fn get_vault_metrics(&self) -> VaultMetrics {
        self.core.lock().await.ledger.metrics()
    }

    /// Recent monitoring alerts, oldest first.
    pub async fn alerts(&self) -> Vec<VaultAlert> {
        self.core
            .lock()
            .await
            .monitor
            .get_active_alerts()
            .cloned()
            .collect()
    }

    /// Full ledger event history.
    pub async fn events(&self) -> Vec<VaultEvent> {
        self.core.lock().await.ledger.journal().to_vec()
    }

    // ==================== Operator API ====================

    /// Rebalance to a fresh plan, ignoring the interval and yield threshold.
    pub async fn trigger_rebalance(&self, caller: &str) -> VaultResult<RebalanceReport> {
        self.authorize(caller)?;
        let _guard = self.begin_maintenance()?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let state = core.ledger.state();
        if state.halted {
            return Err(VaultError::Halted);
        }
        if state.emergency {
            return Err(VaultError::EmergencyActive);
        }

        info!(caller, "Operator rebalance");
        let plan = self.rebalancer.plan(&core.ledger);
        let result = self.rebalancer.execute_rebalance(&mut core, &plan, now).await;
        self.finish(&mut core, result, now).await
    }

    /// Enter emergency mode and exit every non-blacklisted strategy.
    pub async fn activate_emergency(
        &self,
        caller: &str,
        reason: &str,
    ) -> VaultResult<EmergencyReport> {
        self.authorize(caller)?;
        let _guard = self.begin_maintenance()?;
        let now = Utc::now();
        let mut core = self.core.lock().await;

        warn!(caller, reason, "Emergency activation");
        let result = self.emergency.activate(&mut core, reason, now).await;
        self.finish(&mut core, result, now).await
    }

    /// Leave emergency mode without redeploying.
    pub async fn deactivate_emergency(&self, caller: &str) -> VaultResult<()> {
        self.authorize(caller)?;
        let _guard = self.begin_maintenance()?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let state = core.ledger.state();
        if state.halted {
            return Err(VaultError::Halted);
        }
        if !state.emergency {
            return Ok(());
        }

        let result = self.emergency.deactivate(&mut core, now);
        self.finish(&mut core, result, now).await
    }

    /// Exit and blacklist a single strategy.
    pub async fn exit_strategy(&self, caller: &str, id: &StrategyId) -> VaultResult<ExitOutcome> {
        self.authorize(caller)?;
        let _guard = self.begin_maintenance()?;
        let now = Utc::now();
        let mut core = self.core.lock().await;

        info!(caller, %id, "Operator strategy exit");
        let result = self.emergency.exit_strategy(&mut core, id, now).await;
        self.finish(&mut core, result, now).await
    }

    /// Make an adapter available under `key`.
    pub async fn attach_backend(
        &self,
        caller: &str,
        key: &str,
        adapter: Arc<dyn StrategyCapability>,
    ) -> VaultResult<()> {
        self.authorize(caller)?;
        self.core.lock().await.backends.insert(key, adapter);
        info!(key, "Backend attached");
        Ok(())
    }

    /// Add a strategy. Its backend key must already resolve to an adapter.
    pub async fn register_strategy(&self, caller: &str, strategy: NewStrategy) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        if !core.backends.contains(&strategy.backend) {
            return Err(VaultError::UnknownBackend(strategy.backend));
        }
        core.ledger.registry().check_registration(&strategy)?;

        let result = core
            .ledger
            .record(VaultEventKind::StrategyRegistered { strategy }, now);
        self.finish(&mut core, result, now).await
    }

    /// Return a blacklisted strategy to service.
    ///
    /// A `StuckCapital` strategy qualifies once nothing is left allocated to
    /// it. A strategy whose risk is above the ceiling comes back throttled.
    pub async fn reenable_strategy(&self, caller: &str, id: &StrategyId) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let result = reenable(&mut core, id, now);
        self.finish(&mut core, result, now).await
    }

    /// Stop using a strategy for good. Its capital stays until exited.
    pub async fn deactivate_strategy(&self, caller: &str, id: &StrategyId) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let result = core.ledger.record(
            VaultEventKind::Deactivated {
                strategy_id: id.clone(),
            },
            now,
        );
        self.finish(&mut core, result, now).await
    }

    /// Exclude an empty strategy from allocation until re-enabled. A
    /// strategy still holding capital must be exited instead.
    pub async fn blacklist_strategy(&self, caller: &str, id: &StrategyId) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let record = core.ledger.registry().get(id)?;
        if record.allocation > Decimal::ZERO {
            return Err(VaultError::InvalidTransition {
                id: id.clone(),
                from: format!("{} holding {}", record.status, record.allocation),
                to: StrategyStatus::Blacklisted.to_string(),
            });
        }
        let result = core.set_status(id, StrategyStatus::Blacklisted, now);
        warn!(caller, %id, "Strategy blacklisted by operator");
        self.finish(&mut core, result, now).await
    }

    /// Remove a strategy's stuck allocation from total capital.
    /// Returns the amount written off.
    pub async fn write_off_stuck(&self, caller: &str, id: &StrategyId) -> VaultResult<Decimal> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        let result = write_off(&mut core, id, now);
        self.finish(&mut core, result, now).await
    }

    /// Lift the halt set by a consistency violation once the ledger checks
    /// out again. Emergency mode stays until deactivated separately.
    pub async fn clear_halt(&self, caller: &str) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        if !core.ledger.state().halted {
            return Ok(());
        }
        core.ledger.check_invariants()?;

        core.ledger.record(VaultEventKind::HaltCleared, now)?;
        info!("Vault halt cleared by operator");
        self.persist(&mut core);
        Ok(())
    }

    /// Stop accepting deposits.
    pub async fn pause(&self, caller: &str) -> VaultResult<()> {
        self.set_paused(caller, true).await
    }

    pub async fn resume(&self, caller: &str) -> VaultResult<()> {
        self.set_paused(caller, false).await
    }

    async fn set_paused(&self, caller: &str, paused: bool) -> VaultResult<()> {
        self.authorize(caller)?;
        let now = Utc::now();
        let mut core = self.core.lock().await;
        if core.ledger.state().paused == paused {
            return Ok(());
        }
        let kind = if paused {
            VaultEventKind::Paused
        } else {
            VaultEventKind::Resumed
        };
        let result = core.ledger.record(kind, now);
        info!(caller, paused, "Deposit intake toggled");
        self.finish(&mut core, result, now).await
    }

    // ==================== Internals ====================

    fn authorize(&self, caller: &str) -> VaultResult<()> {
        if self.config.vault.operators.iter().any(|op| op == caller) {
            Ok(())
        } else {
            warn!(caller, "Rejected operator call");
            Err(VaultError::Unauthorized(caller.to_string()))
        }
    }

    fn begin_maintenance(&self) -> VaultResult<MaintenanceGuard<'_>> {
        self.maintenance
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| VaultError::RebalanceInProgress)?;
        Ok(MaintenanceGuard {
            flag: &self.maintenance,
        })
    }

    fn call_timeout(&self) -> Duration {
        self.config.execution.call_timeout()
    }

    /// Close out an operation: align rail custody with idle, verify the
    /// ledger (halting on a violation) and persist new events.
    async fn finish<T>(
        &self,
        core: &mut VaultCore,
        result: VaultResult<T>,
        now: DateTime<Utc>,
    ) -> VaultResult<T> {
        self.sync_custody(core).await;
        if let Err(violation) = core.ledger.check_invariants() {
            if !core.ledger.state().halted {
                core.halt(&violation.to_string(), now);
            }
            self.persist(core);
            return Err(violation);
        }
        self.persist(core);
        result
    }

    /// Move the difference between ledger idle and rail custody through
    /// the rail.
    async fn sync_custody(&self, core: &mut VaultCore) {
        let idle = core.ledger.state().idle;
        let delta = idle - core.custody;
        if delta.is_zero() {
            return;
        }

        let outcome = if delta > Decimal::ZERO {
            guarded(self.call_timeout(), self.rail.accept_up_to(delta)).await
        } else {
            match guarded(self.call_timeout(), self.rail.withdraw_up_to(-delta, idle)).await {
                CallOutcome::Ok(released) => CallOutcome::Ok(-released),
                failed => failed,
            }
        };
        match outcome {
            CallOutcome::Ok(moved) => core.custody += moved,
            failed => warn!(%delta, outcome = %failed, "Funds rail sync failed"),
        }
        if core.custody != idle {
            warn!(custody = %core.custody, %idle, "Funds rail out of step with idle buffer");
        }
    }

    /// Append unpersisted events to the store, keeping them for a retry if
    /// the write fails.
    fn persist(&self, core: &mut VaultCore) {
        let Some(store) = &self.store else {
            return;
        };
        let pending = core.ledger.unpersisted().len();
        if pending == 0 {
            return;
        }
        let written = match store.lock() {
            Ok(store) => store.append(core.ledger.unpersisted()),
            Err(_) => {
                error!("Event store lock poisoned");
                return;
            }
        };
        match written {
            Ok(count) => core.ledger.mark_persisted(count),
            Err(e) => error!(error = %e, pending, "Failed to persist events, will retry"),
        }
    }

    fn snapshot(&self, metrics: &VaultMetrics) {
        if let Some(store) = &self.store {
            if let Ok(store) = store.lock() {
                if let Err(e) = store.record_snapshot(metrics) {
                    warn!(error = %e, "Failed to record metrics snapshot");
                }
            }
        }
    }
}

pub(crate) fn empty_registry(config: &Config) -> StrategyRegistry {
    StrategyRegistry::new(
        config.allocation.max_single_allocation,
        config.allocation.risk_ceiling,
        config.risk.emergency_exit_threshold,
    )
}

fn reenable(core: &mut VaultCore, id: &StrategyId, now: DateTime<Utc>) -> VaultResult<()> {
    let record = core.ledger.registry().get(id)?;
    let (status, allocation, risk) = (record.status, record.allocation, record.risk_score);
    match status {
        StrategyStatus::Blacklisted => {}
        StrategyStatus::StuckCapital if allocation.is_zero() => {
            core.set_status(id, StrategyStatus::Blacklisted, now)?;
        }
        other => {
            return Err(VaultError::InvalidTransition {
                id: id.clone(),
                from: other.to_string(),
                to: StrategyStatus::Active.to_string(),
            })
        }
    }

    core.set_status(id, StrategyStatus::Active, now)?;
    if risk > core.ledger.registry().risk_ceiling() {
        core.set_status(id, StrategyStatus::Throttled, now)?;
    }
    core.monitor.clear_strategy(id);
    info!(%id, "Strategy re-enabled");
    Ok(())
}

fn write_off(core: &mut VaultCore, id: &StrategyId, now: DateTime<Utc>) -> VaultResult<Decimal> {
    let record = core.ledger.registry().get(id)?;
    if record.status != StrategyStatus::StuckCapital {
        return Err(VaultError::InvalidTransition {
            id: id.clone(),
            from: record.status.to_string(),
            to: "WRITTEN_OFF".to_string(),
        });
    }
    let amount = record.allocation;
    if amount > Decimal::ZERO {
        core.ledger.record(
            VaultEventKind::WrittenOff {
                strategy_id: id.clone(),
                amount,
            },
            now,
        )?;
    }
    core.set_status(id, StrategyStatus::Blacklisted, now)?;
    warn!(%id, %amount, "Stuck capital written off");
    Ok(amount)
}
