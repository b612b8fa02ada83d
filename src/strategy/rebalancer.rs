//! Rebalance triggers and fault-tolerant capital moves between strategies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AllocationOptimizer, AllocationPlan, StrategyId, StrategyStatus};
use crate::backend::{scatter, CallOutcome};
use crate::config::Config;
use crate::error::{VaultError, VaultResult};
use crate::utils::decimal::{floor_to_scale, mul_div_floor, safe_div, to_basis_points};
use crate::vault::{VaultCore, VaultEventKind, VaultLedger, VaultState};

/// Result of a rebalance or deployment pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebalanceReport {
    /// Expected yield of the plan that drove the pass
    pub expected_yield: Decimal,
    /// Capital recalled from over-allocated strategies
    pub withdrawn: Decimal,
    /// Capital placed into under-allocated strategies
    pub deployed: Decimal,
    /// Calls that failed, with the reason
    pub failures: Vec<(StrategyId, String)>,
    /// Strategies flagged as holding stuck capital during the pass
    pub stuck: Vec<StrategyId>,
}

/// Outcome of one recall request.
#[derive(Debug, Clone)]
struct Recall {
    id: StrategyId,
    recovered: Decimal,
    failed: bool,
}

/// Decides when to move capital and executes the moves.
#[derive(Debug, Clone)]
pub struct RebalanceController {
    optimizer: AllocationOptimizer,
    min_interval: ChronoDuration,
    threshold_bps: Decimal,
    idle_buffer_ratio: Decimal,
    drift_threshold: Decimal,
    amount_scale: u32,
    call_timeout: Duration,
}

impl RebalanceController {
    pub fn new(config: &Config) -> Self {
        Self {
            optimizer: AllocationOptimizer::new(
                config.allocation.clone(),
                config.vault.amount_scale,
            ),
            min_interval: ChronoDuration::seconds(config.rebalance.min_interval_secs as i64),
            threshold_bps: Decimal::from(config.rebalance.threshold_bps),
            idle_buffer_ratio: config.vault.idle_buffer_ratio,
            drift_threshold: config.vault.drift_threshold,
            amount_scale: config.vault.amount_scale,
            call_timeout: config.execution.call_timeout(),
        }
    }

    /// Idle capital kept back for withdrawals.
    pub fn idle_reserve(&self, state: &VaultState) -> Decimal {
        floor_to_scale(state.total_capital * self.idle_buffer_ratio, self.amount_scale)
    }

    /// Capital the optimizer may place: total capital minus the idle
    /// reserve and minus capital held by strategies that take no new
    /// allocation (throttled, exiting, stuck, blacklisted, deactivated).
    pub fn deployable(&self, ledger: &VaultLedger) -> Decimal {
        let held: Decimal = ledger
            .registry()
            .records()
            .filter(|r| !r.accepts_new_allocation())
            .map(|r| r.allocation)
            .sum();
        let state = ledger.state();
        (state.total_capital - self.idle_reserve(state) - held).max(Decimal::ZERO)
    }

    /// Whether idle sits far enough above target to deploy after a deposit.
    pub fn deposit_drift(&self, state: &VaultState) -> bool {
        if state.total_capital.is_zero() {
            return false;
        }
        safe_div(state.idle, state.total_capital) > self.idle_buffer_ratio + self.drift_threshold
    }

    /// Whether a withdrawal drained idle down to target minus drift.
    pub fn withdraw_drift(&self, state: &VaultState) -> bool {
        if state.total_capital.is_zero() || state.deployed() <= Decimal::ZERO {
            return false;
        }
        safe_div(state.idle, state.total_capital) <= self.idle_buffer_ratio - self.drift_threshold
    }

    /// Target plan for the currently deployable capital.
    pub fn plan(&self, ledger: &VaultLedger) -> AllocationPlan {
        let registry = ledger.registry();
        self.optimizer.calculate_optimal_allocation(
            registry,
            self.deployable(ledger),
            registry.risk_ceiling(),
        )
    }

    /// Plan to execute now, if any.
    ///
    /// Outside a forced run the interval gate applies unless a drift
    /// rebalance is due, and the plan must either beat the current weighted
    /// yield by the configured margin or place capital that is sitting idle.
    pub fn should_rebalance(
        &self,
        ledger: &VaultLedger,
        now: DateTime<Utc>,
        force: bool,
    ) -> Option<AllocationPlan> {
        let state = ledger.state();
        if state.emergency || state.halted {
            return None;
        }

        if !force && !state.rebalance_due {
            if let Some(last) = state.last_rebalance {
                if now - last < self.min_interval {
                    debug!(%last, "Rebalance interval not elapsed");
                    return None;
                }
            }
        }

        let plan = self.plan(ledger);
        if force || state.rebalance_due {
            return Some(plan);
        }

        let current_yield = AllocationOptimizer::current_weighted_yield(ledger.registry());
        let improvement_bps = to_basis_points(plan.expected_yield - current_yield);
        let currently_placed: Decimal = ledger
            .registry()
            .records()
            .filter(|r| r.accepts_new_allocation())
            .map(|r| r.allocation)
            .sum();
        let undeployed = plan.placed() - currently_placed;

        debug!(
            plan_yield = %plan.expected_yield,
            %current_yield,
            %improvement_bps,
            %undeployed,
            "Rebalance check"
        );

        if improvement_bps > self.threshold_bps || undeployed > Decimal::ZERO {
            Some(plan)
        } else {
            None
        }
    }

    /// Move capital toward `plan`.
    ///
    /// Surplus is recalled from over-allocated strategies first; a strategy
    /// whose recall fails is flagged `StuckCapital` with its allocation left
    /// in the ledger. Freed capital plus idle above the reserve is then
    /// deployed in id order; a failed deploy leaves the capital idle.
    pub async fn execute_rebalance(
        &self,
        core: &mut VaultCore,
        plan: &AllocationPlan,
        now: DateTime<Utc>,
    ) -> VaultResult<RebalanceReport> {
        let mut report = RebalanceReport {
            expected_yield: plan.expected_yield,
            ..Default::default()
        };

        let mut targets = Vec::new();
        let mut surplus = Vec::new();
        for record in core
            .ledger
            .registry()
            .records()
            .filter(|r| r.accepts_new_allocation())
        {
            let target = plan.target_for(&record.id);
            if record.target_allocation != target {
                targets.push((record.id.clone(), target));
            }
            if record.allocation > target {
                surplus.push((record.id.clone(), record.allocation - target));
            }
        }
        for (id, target) in targets {
            core.ledger.record(
                VaultEventKind::TargetSet {
                    strategy_id: id,
                    target,
                },
                now,
            )?;
        }

        for recall in self.recall(core, surplus, now).await? {
            report.withdrawn += recall.recovered;
            if recall.failed {
                let allocation = core.ledger.registry().get(&recall.id)?.allocation;
                core.set_status(&recall.id, StrategyStatus::StuckCapital, now)?;
                core.monitor.record_stuck_capital(&recall.id, allocation);
                report
                    .failures
                    .push((recall.id.clone(), "withdraw failed".to_string()));
                report.stuck.push(recall.id);
            }
        }

        let state = core.ledger.state();
        let mut budget = (state.idle - self.idle_reserve(state)).max(Decimal::ZERO);
        let mut asks = Vec::new();
        let registry = core.ledger.registry();
        for record in registry.records().filter(|r| r.accepts_new_allocation()) {
            let target = plan.target_for(&record.id);
            if target <= record.allocation || budget <= Decimal::ZERO {
                continue;
            }
            let want = floor_to_scale(
                (target - record.allocation)
                    .min(registry.headroom(record))
                    .min(budget),
                self.amount_scale,
            );
            if want > Decimal::ZERO {
                budget -= want;
                asks.push((record.id.clone(), want));
            }
        }
        self.deploy(core, asks, now, &mut report).await?;

        core.ledger.record(VaultEventKind::Rebalanced, now)?;
        info!(
            withdrawn = %report.withdrawn,
            deployed = %report.deployed,
            failures = report.failures.len(),
            expected_yield = %report.expected_yield,
            "Rebalance executed"
        );
        Ok(report)
    }

    /// Deploy idle capital above the reserve into remaining headroom.
    pub async fn deploy_incremental(
        &self,
        core: &mut VaultCore,
        now: DateTime<Utc>,
    ) -> VaultResult<RebalanceReport> {
        let state = core.ledger.state();
        let amount = floor_to_scale(
            (state.idle - self.idle_reserve(state)).max(Decimal::ZERO),
            self.amount_scale,
        );
        if amount.is_zero() {
            return Ok(RebalanceReport::default());
        }

        let registry = core.ledger.registry();
        let plan =
            self.optimizer
                .calculate_incremental_allocation(registry, amount, registry.risk_ceiling());
        let asks = plan
            .entries
            .iter()
            .map(|e| (e.strategy_id.clone(), e.amount))
            .collect();

        let mut report = RebalanceReport {
            expected_yield: plan.expected_yield,
            ..Default::default()
        };
        self.deploy(core, asks, now, &mut report).await?;
        info!(
            %amount,
            deployed = %report.deployed,
            unplaced = %plan.unplaced,
            "Incremental deployment"
        );
        Ok(report)
    }

    /// Pull `needed` from strategies in proportion to their current
    /// allocation. Strategies flagged stuck are skipped.
    ///
    /// A strategy that fails is skipped and the shortfall is spread over
    /// every other source in a second pass, including ones whose first-pass
    /// share floored to zero. Whatever comes back is moved to
    /// idle; if it falls short the call fails with `InsufficientLiquidity`.
    pub async fn withdraw_proportional(
        &self,
        core: &mut VaultCore,
        needed: Decimal,
        now: DateTime<Utc>,
    ) -> VaultResult<Decimal> {
        if needed <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let sources: Vec<(StrategyId, Decimal)> = core
            .ledger
            .registry()
            .records()
            .filter(|r| r.allocation > Decimal::ZERO && r.status != StrategyStatus::StuckCapital)
            .map(|r| (r.id.clone(), r.allocation))
            .collect();
        let asks = self.apportion(&sources, needed);
        let first = self.recall(core, asks, now).await?;
        let mut recovered: Decimal = first.iter().map(|r| r.recovered).sum();

        if recovered < needed {
            let failed: Vec<&StrategyId> =
                first.iter().filter(|r| r.failed).map(|r| &r.id).collect();
            let retry: Vec<(StrategyId, Decimal)> = sources
                .iter()
                .filter(|(id, _)| !failed.contains(&id))
                .filter_map(|(id, _)| {
                    core.ledger
                        .registry()
                        .get(id)
                        .ok()
                        .filter(|record| record.allocation > Decimal::ZERO)
                        .map(|record| (record.id.clone(), record.allocation))
                })
                .collect();
            if !retry.is_empty() {
                debug!(
                    shortfall = %(needed - recovered),
                    strategies = retry.len(),
                    "Redistributing withdrawal shortfall"
                );
                let asks = self.apportion(&retry, needed - recovered);
                let second = self.recall(core, asks, now).await?;
                recovered += second.iter().map(|r| r.recovered).sum::<Decimal>();
            }
        }

        if recovered < needed {
            warn!(%needed, %recovered, "Strategies could not cover withdrawal");
            return Err(VaultError::InsufficientLiquidity {
                needed,
                available: recovered,
            });
        }
        Ok(recovered)
    }

    /// Split `amount` across `sources` by their allocation share, floored;
    /// the last source absorbs the remainder. Never asks a source for more
    /// than it holds.
    fn apportion(&self, sources: &[(StrategyId, Decimal)], amount: Decimal) -> Vec<(StrategyId, Decimal)> {
        let total: Decimal = sources.iter().map(|(_, a)| *a).sum();
        if total <= Decimal::ZERO || amount <= Decimal::ZERO {
            return Vec::new();
        }
        let amount = amount.min(total);

        let mut asks = Vec::with_capacity(sources.len());
        let mut assigned = Decimal::ZERO;
        for (i, (id, allocation)) in sources.iter().enumerate() {
            let share = if i + 1 == sources.len() {
                amount - assigned
            } else {
                mul_div_floor(amount, *allocation, total, self.amount_scale)
                    .unwrap_or(Decimal::ZERO)
            };
            let share = share.min(*allocation);
            assigned += share;
            if share > Decimal::ZERO {
                asks.push((id.clone(), share));
            }
        }
        asks
    }

    /// Scatter `withdraw` calls and move what comes back to idle.
    async fn recall(
        &self,
        core: &mut VaultCore,
        asks: Vec<(StrategyId, Decimal)>,
        now: DateTime<Utc>,
    ) -> VaultResult<Vec<Recall>> {
        if asks.is_empty() {
            return Ok(Vec::new());
        }
        let targets = asks
            .iter()
            .map(|(id, amount)| core.call_target(id, *amount))
            .collect();
        let outcomes = scatter(targets, self.call_timeout, |backend, amount| async move {
            backend.withdraw(amount).await
        })
        .await;

        let mut recalls = Vec::with_capacity(asks.len());
        for ((id, asked), (_, outcome)) in asks.into_iter().zip(outcomes) {
            match outcome {
                CallOutcome::Ok(released) => {
                    let allocation = core.ledger.registry().get(&id)?.allocation;
                    let recovered =
                        floor_to_scale(released.min(asked).min(allocation), self.amount_scale);
                    if recovered > Decimal::ZERO {
                        core.ledger.record(
                            VaultEventKind::Recalled {
                                strategy_id: id.clone(),
                                amount: recovered,
                            },
                            now,
                        )?;
                    }
                    core.monitor.record_success(&id);
                    debug!(%id, %asked, %recovered, "Recalled from strategy");
                    recalls.push(Recall {
                        id,
                        recovered,
                        failed: false,
                    });
                }
                failed => {
                    warn!(%id, %asked, outcome = %failed, "Recall failed");
                    core.note_failure(&id, "withdraw", &failed, now)?;
                    recalls.push(Recall {
                        id,
                        recovered: Decimal::ZERO,
                        failed: true,
                    });
                }
            }
        }
        Ok(recalls)
    }

    /// Scatter `deploy` calls; only confirmed deploys leave idle.
    async fn deploy(
        &self,
        core: &mut VaultCore,
        asks: Vec<(StrategyId, Decimal)>,
        now: DateTime<Utc>,
        report: &mut RebalanceReport,
    ) -> VaultResult<()> {
        if asks.is_empty() {
            return Ok(());
        }
        let targets = asks
            .iter()
            .map(|(id, amount)| core.call_target(id, *amount))
            .collect();
        let outcomes = scatter(targets, self.call_timeout, |backend, amount| async move {
            backend.deploy(amount).await
        })
        .await;

        for ((id, amount), (_, outcome)) in asks.into_iter().zip(outcomes) {
            match outcome {
                CallOutcome::Ok(()) => {
                    core.ledger.record(
                        VaultEventKind::Deployed {
                            strategy_id: id.clone(),
                            amount,
                        },
                        now,
                    )?;
                    core.monitor.record_success(&id);
                    report.deployed += amount;
                }
                failed => {
                    warn!(%id, %amount, outcome = %failed, "Deploy failed, capital stays idle");
                    core.note_failure(&id, "deploy", &failed, now)?;
                    report.failures.push((id, failed.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::test_support::{deposit, harness, test_config, Harness};
    use rust_decimal_macros::dec;

    fn controller() -> RebalanceController {
        RebalanceController::new(&test_config())
    }

    #[tokio::test]
    async fn test_rebalance_deploys_above_reserve() {
        let Harness { mut core, .. } = harness();
        deposit(&mut core, "alice", dec!(1000));
        let rebalancer = controller();
        let now = Utc::now();

        let plan = rebalancer.should_rebalance(&core.ledger, now, false).unwrap();
        assert_eq!(plan.placed(), dec!(900));
        let report = rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();

        assert_eq!(report.deployed, dec!(900));
        assert_eq!(core.ledger.state().idle, dec!(100));
        assert_eq!(core.ledger.state().last_rebalance, Some(now));
        core.ledger.check_invariants().unwrap();

        // Nothing left to improve and the interval gate holds
        assert!(rebalancer.should_rebalance(&core.ledger, now, false).is_none());
    }

    #[tokio::test]
    async fn test_deploy_failure_keeps_capital_idle() {
        let Harness { mut core, mocks } = harness();
        deposit(&mut core, "alice", dec!(1000));
        mocks["a"].fail_deploy(true);
        let rebalancer = controller();
        let now = Utc::now();

        let plan = rebalancer.plan(&core.ledger);
        let report = rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();

        let a = core.ledger.registry().get(&StrategyId::new("a")).unwrap();
        assert_eq!(a.allocation, Decimal::ZERO);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(core.monitor.failure_count(&StrategyId::new("a")), 1);
        assert_eq!(
            core.ledger.state().idle,
            dec!(1000) - report.deployed
        );
        core.ledger.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_failed_surplus_recall_flags_stuck() {
        let Harness { mut core, mocks } = harness();
        deposit(&mut core, "alice", dec!(1000));
        let rebalancer = controller();
        let now = Utc::now();
        let plan = rebalancer.plan(&core.ledger);
        rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();

        // b now scores far better; a must give capital back but cannot
        let id_a = StrategyId::new("a");
        core.ledger
            .record(
                VaultEventKind::MetricsUpdated {
                    strategy_id: StrategyId::new("b"),
                    current_yield: dec!(0.50),
                    liquidity_depth: dec!(1_000_000),
                    balance: dec!(0),
                },
                now,
            )
            .unwrap();
        mocks["a"].fail_withdraw(true);
        let allocation_before = core.ledger.registry().get(&id_a).unwrap().allocation;

        let plan = rebalancer.plan(&core.ledger);
        let report = rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();

        let a = core.ledger.registry().get(&id_a).unwrap();
        assert_eq!(a.status, StrategyStatus::StuckCapital);
        assert_eq!(a.allocation, allocation_before);
        assert!(report.stuck.contains(&id_a));
        core.ledger.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_proportional_redistributes() {
        let Harness { mut core, mocks } = harness();
        deposit(&mut core, "alice", dec!(1000));
        let rebalancer = controller();
        let now = Utc::now();
        let plan = rebalancer.plan(&core.ledger);
        rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();

        mocks["a"].fail_withdraw(true);
        let recovered = rebalancer
            .withdraw_proportional(&mut core, dec!(300), now)
            .await
            .unwrap();
        // a's 171 share is covered by b in the second pass
        assert_eq!(recovered, dec!(300));
        assert_eq!(core.ledger.state().idle, dec!(400));
        assert_eq!(
            core.ledger.registry().get(&StrategyId::new("a")).unwrap().allocation,
            dec!(514)
        );
        core.ledger.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_proportional_all_fail() {
        let Harness { mut core, mocks } = harness();
        deposit(&mut core, "alice", dec!(1000));
        let rebalancer = controller();
        let now = Utc::now();
        let plan = rebalancer.plan(&core.ledger);
        rebalancer.execute_rebalance(&mut core, &plan, now).await.unwrap();
        let total_before = core.ledger.state().total_capital;

        for mock in mocks.values() {
            mock.fail_withdraw(true);
        }
        let err = rebalancer
            .withdraw_proportional(&mut core, dec!(400), now)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientLiquidity { .. }));
        assert_eq!(core.ledger.state().total_capital, total_before);
        assert_eq!(core.ledger.state().idle, dec!(100));
    }

    #[test]
    fn test_apportion_sums_exactly() {
        let rebalancer = controller();
        let sources = vec![
            (StrategyId::new("a"), dec!(300)),
            (StrategyId::new("b"), dec!(300)),
            (StrategyId::new("c"), dec!(300)),
        ];
        let asks = rebalancer.apportion(&sources, dec!(100));
        assert_eq!(asks.iter().map(|(_, a)| *a).sum::<Decimal>(), dec!(100));
        assert_eq!(asks[0].1, dec!(33));
        assert_eq!(asks[2].1, dec!(34));
    }

    #[test]
    fn test_drift_triggers() {
        let rebalancer = controller();
        let mut state = VaultState {
            total_capital: dec!(1000),
            idle: dec!(1000),
            total_shares: dec!(1000),
            ..Default::default()
        };
        assert!(rebalancer.deposit_drift(&state));
        assert!(!rebalancer.withdraw_drift(&state));

        state.idle = dec!(10);
        assert!(!rebalancer.deposit_drift(&state));
        assert!(rebalancer.withdraw_drift(&state));
    }
}
