//! Periodic maintenance: metric refresh, harvest, risk reassessment, stuck
//! exit retries and interval rebalancing.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{Vault, VaultCore, VaultEventKind};
use crate::backend::{guarded, scatter, CallOutcome};
use crate::error::{VaultError, VaultResult};
use crate::risk::RiskReading;
use crate::strategy::{ExitOutcome, RebalanceReport, StrategyId, StrategyStatus};
use crate::utils::decimal::floor_to_scale;

/// What a maintenance tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Strategies whose metrics and balance were refreshed
    pub refreshed: usize,
    /// Yield booked into idle
    pub harvested: Decimal,
    /// Strategies whose recorded risk score changed
    pub risk_changes: usize,
    /// Exits forced by a risk score above the emergency threshold
    pub exits: Vec<ExitOutcome>,
    /// Stuck exits retried
    pub retried: Vec<ExitOutcome>,
    pub rebalance: Option<RebalanceReport>,
}

impl Vault {
    /// Run one maintenance pass.
    pub async fn tick(&self) -> VaultResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one maintenance pass as of `now`.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> VaultResult<TickReport> {
        let _guard = self.begin_maintenance()?;
        let mut core = self.core.lock().await;
        if core.ledger.state().halted {
            return Err(VaultError::Halted);
        }

        let result = self.tick_locked(&mut core, now).await;
        let report = self.finish(&mut core, result, now).await?;
        self.snapshot(&core.ledger.metrics());
        Ok(report)
    }

    async fn tick_locked(&self, core: &mut VaultCore, now: DateTime<Utc>) -> VaultResult<TickReport> {
        let mut report = TickReport {
            refreshed: self.refresh(core, now).await?,
            harvested: self.harvest(core, now).await?,
            ..Default::default()
        };

        let (risk_changes, forced) = self.reassess_risk(core, now).await?;
        report.risk_changes = risk_changes;
        for id in forced {
            warn!(%id, "Risk above emergency threshold, exiting strategy");
            report
                .exits
                .push(self.emergency.exit_strategy(core, &id, now).await?);
        }

        report.retried = self.emergency.retry_stuck(core, now).await?;

        if !core.ledger.state().emergency {
            if let Some(plan) = self.rebalancer.should_rebalance(&core.ledger, now, false) {
                report.rebalance = Some(self.rebalancer.execute_rebalance(core, &plan, now).await?);
            }
        }

        info!(
            refreshed = report.refreshed,
            harvested = %report.harvested,
            risk_changes = report.risk_changes,
            exits = report.exits.len(),
            retried = report.retried.len(),
            rebalanced = report.rebalance.is_some(),
            "Maintenance tick"
        );
        Ok(report)
    }

    /// Pull yield, depth and marked balance from every live strategy.
    async fn refresh(&self, core: &mut VaultCore, now: DateTime<Utc>) -> VaultResult<usize> {
        let targets = core
            .ledger
            .registry()
            .records()
            .filter(|r| !r.status.is_blacklisted())
            .map(|r| core.call_target(&r.id, ()))
            .collect();
        let outcomes = scatter(targets, self.call_timeout(), |backend, _| async move {
            let metrics = backend.metrics().await?;
            let balance = backend.get_balance().await?;
            Ok::<_, anyhow::Error>((metrics, balance))
        })
        .await;

        let mut refreshed = 0;
        for (id, outcome) in outcomes {
            match outcome {
                CallOutcome::Ok((metrics, balance)) => {
                    core.ledger.record(
                        VaultEventKind::MetricsUpdated {
                            strategy_id: id.clone(),
                            current_yield: metrics.apy,
                            liquidity_depth: metrics.liquidity_depth,
                            balance,
                        },
                        now,
                    )?;
                    core.monitor.record_success(&id);
                    refreshed += 1;
                }
                failed => {
                    core.note_failure(&id, "refresh", &failed, now)?;
                }
            }
        }
        Ok(refreshed)
    }

    /// Realize accrued yield into idle. Skipped while no shares exist,
    /// since there is nobody to credit it to.
    async fn harvest(&self, core: &mut VaultCore, now: DateTime<Utc>) -> VaultResult<Decimal> {
        if core.ledger.state().total_shares.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let targets = core
            .ledger
            .registry()
            .records()
            .filter(|r| r.allocation > Decimal::ZERO && !r.status.is_blacklisted())
            .map(|r| core.call_target(&r.id, ()))
            .collect();
        let outcomes = scatter(targets, self.call_timeout(), |backend, _| async move {
            backend.harvest().await
        })
        .await;

        let scale = core.ledger.amount_scale();
        let mut harvested = Decimal::ZERO;
        for (id, outcome) in outcomes {
            match outcome {
                CallOutcome::Ok(realized) => {
                    let amount = floor_to_scale(realized, scale);
                    if amount <= Decimal::ZERO {
                        continue;
                    }
                    core.ledger.record(
                        VaultEventKind::YieldHarvested {
                            strategy_id: id.clone(),
                            amount,
                        },
                        now,
                    )?;
                    debug!(%id, %amount, "Yield harvested");
                    harvested += amount;
                }
                failed => {
                    core.note_failure(&id, "harvest", &failed, now)?;
                }
            }
        }
        Ok(harvested)
    }

    /// Query the risk oracle for every strategy that is not blacklisted and
    /// record changed scores. A degraded reading is recorded as maximum
    /// risk.
    ///
    /// Returns the number of changed scores and the strategies whose
    /// effective score crossed the emergency threshold.
    async fn reassess_risk(
        &self,
        core: &mut VaultCore,
        now: DateTime<Utc>,
    ) -> VaultResult<(usize, Vec<StrategyId>)> {
        let ids: Vec<StrategyId> = core
            .ledger
            .registry()
            .records()
            .filter(|r| r.status != StrategyStatus::Blacklisted)
            .map(|r| r.id.clone())
            .collect();
        let timeout = self.call_timeout();
        let outcomes = join_all(
            ids.iter()
                .map(|id| guarded(timeout, self.oracle.assess_strategy_risk(id))),
        )
        .await;

        let staleness = chrono::Duration::seconds(self.config.risk.oracle_staleness_secs as i64);
        let emergency_threshold = core.ledger.registry().emergency_exit_threshold();
        let mut changes = 0;
        let mut forced = Vec::new();

        for (id, outcome) in ids.into_iter().zip(outcomes) {
            let reading = RiskReading::from_outcome(outcome, now, staleness);
            if let RiskReading::Degraded { reason } = &reading {
                core.monitor.record_oracle_degraded(&id, reason);
            }
            let score = reading.effective_score();
            let record = core.ledger.registry().get(&id)?;
            let (previous_score, previous_status) = (record.risk_score, record.status);

            if score != previous_score {
                core.ledger.record(
                    VaultEventKind::RiskUpdated {
                        strategy_id: id.clone(),
                        risk_score: score,
                    },
                    now,
                )?;
                changes += 1;
            }

            let exitable = matches!(
                previous_status,
                StrategyStatus::Active | StrategyStatus::Throttled
            );
            if score > emergency_threshold && exitable {
                forced.push(id);
            }
        }
        Ok((changes, forced))
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{LiquidBuffer, MockStrategy};
    use crate::error::VaultError;
    use crate::persistence::EventStore;
    use crate::risk::{ImpairmentKind, RiskAssessment, StaticRiskOracle};
    use crate::strategy::{StrategyId, StrategyStatus, MAX_RISK_SCORE};
    use crate::vault::test_support::{sample_backends, sample_strategies, test_config};
    use crate::vault::{StrategyAllocation, Vault};
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const OPERATOR: &str = "operator";

    async fn funded_vault() -> (
        Vault,
        BTreeMap<String, Arc<MockStrategy>>,
        Arc<StaticRiskOracle>,
    ) {
        let (backends, mocks) = sample_backends();
        let oracle = Arc::new(StaticRiskOracle::new());
        let vault = Vault::new(
            test_config(),
            backends,
            oracle.clone(),
            Arc::new(LiquidBuffer::new()),
        )
        .with_store(EventStore::new(":memory:").unwrap());
        for strategy in sample_strategies() {
            oracle.set_score(&strategy.id, strategy.risk_score);
            vault.register_strategy(OPERATOR, strategy).await.unwrap();
        }
        vault.deposit(dec!(1000), "alice").await.unwrap();
        (vault, mocks, oracle)
    }

    async fn line(vault: &Vault, id: &str) -> StrategyAllocation {
        vault
            .get_vault_metrics()
            .await
            .allocations
            .into_iter()
            .find(|l| l.strategy_id.as_str() == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_harvests_yield_into_share_price() {
        let (vault, mocks, _) = funded_vault().await;
        mocks["a"].accrue(dec!(25)).await;

        let report = vault.tick().await.unwrap();
        assert_eq!(report.refreshed, 3);
        assert_eq!(report.harvested, dec!(25));

        let metrics = vault.get_vault_metrics().await;
        assert_eq!(metrics.total_capital, dec!(1025));
        assert_eq!(metrics.share_price, dec!(1.025));
    }

    #[tokio::test]
    async fn test_stale_assessment_counts_as_max_risk_and_exits() {
        let (vault, mocks, oracle) = funded_vault().await;
        let a = StrategyId::new("a");
        oracle.set_assessment(&a, RiskAssessment::new(2000, Utc::now() - ChronoDuration::hours(3)));

        let report = vault.tick().await.unwrap();

        let a_line = line(&vault, "a").await;
        assert_eq!(a_line.status, StrategyStatus::Blacklisted);
        assert_eq!(a_line.risk_score, MAX_RISK_SCORE);
        assert_eq!(a_line.allocation, Decimal::ZERO);
        assert_eq!(mocks["a"].exit_calls(), 1);
        assert_eq!(report.exits.len(), 1);
        assert!(vault
            .alerts()
            .await
            .iter()
            .any(|alert| matches!(
                &alert.kind,
                ImpairmentKind::OracleDegraded { strategy_id, .. } if *strategy_id == a
            )));
    }

    #[tokio::test]
    async fn test_fresh_score_above_threshold_forces_exit() {
        let (vault, mocks, oracle) = funded_vault().await;
        let b = StrategyId::new("b");
        oracle.set_score(&b, 9000);

        let report = vault.tick().await.unwrap();
        assert_eq!(report.risk_changes, 1);
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].strategy_id, b);
        assert_eq!(report.exits[0].recovered, dec!(386));

        let b_line = line(&vault, "b").await;
        assert_eq!(b_line.status, StrategyStatus::Blacklisted);
        assert_eq!(b_line.allocation, Decimal::ZERO);
        assert_eq!(mocks["b"].exit_calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_flag_stuck_capital() {
        let (vault, mocks, _) = funded_vault().await;
        mocks["b"].fail_all(true);

        vault.tick().await.unwrap();
        assert_eq!(line(&vault, "b").await.status, StrategyStatus::Active);

        vault.tick().await.unwrap();
        let b_line = line(&vault, "b").await;
        assert_eq!(b_line.status, StrategyStatus::StuckCapital);
        assert_eq!(b_line.allocation, dec!(386));

        // Stuck capital stays in total capital
        assert_eq!(vault.get_vault_metrics().await.total_capital, dec!(1000));
    }

    #[tokio::test]
    async fn test_halted_vault_refuses_tick() {
        let (vault, _, _) = funded_vault().await;
        {
            let mut core = vault.core.lock().await;
            core.halt("test", Utc::now());
        }
        assert_eq!(vault.tick().await.unwrap_err(), VaultError::Halted);
        assert_eq!(
            vault.deposit(dec!(10), "bob").await,
            Err(VaultError::Halted)
        );

        // Ledger still balances, so the halt can be lifted
        vault.clear_halt(OPERATOR).await.unwrap();
        assert!(vault.get_vault_metrics().await.emergency);
        vault.deactivate_emergency(OPERATOR).await.unwrap();
        assert!(vault.tick().await.is_ok());
    }
}
