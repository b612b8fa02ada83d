//! Forced exits from risky or failed strategies.
//!
//! Every exit runs as its own task with its own timeout. One strategy's
//! failure never stops the others; it only leaves that strategy flagged
//! with stuck capital.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{StrategyId, StrategyStatus};
use crate::backend::{scatter, CallOutcome};
use crate::config::Config;
use crate::error::VaultResult;
use crate::utils::decimal::floor_to_scale;
use crate::vault::{VaultCore, VaultEventKind};

/// Result of exiting one strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitOutcome {
    pub strategy_id: StrategyId,
    /// Ledger allocation before the exit
    pub allocation_before: Decimal,
    /// Principal moved back to idle
    pub recovered: Decimal,
    /// Recovered amount above the allocation, booked as yield
    pub yield_realized: Decimal,
    /// Allocation still held by the strategy
    pub stuck: Decimal,
    pub status: StrategyStatus,
    pub error: Option<String>,
}

/// Aggregated result of an emergency activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyReport {
    pub reason: String,
    pub exits: Vec<ExitOutcome>,
    pub total_recovered: Decimal,
    pub total_stuck: Decimal,
}

impl EmergencyReport {
    /// Strategies left holding capital.
    pub fn stuck_strategies(&self) -> Vec<&StrategyId> {
        self.exits
            .iter()
            .filter(|e| e.status == StrategyStatus::StuckCapital)
            .map(|e| &e.strategy_id)
            .collect()
    }
}

/// Drives global and single-strategy exits.
#[derive(Debug, Clone)]
pub struct EmergencyController {
    amount_scale: u32,
    call_timeout: Duration,
}

impl EmergencyController {
    pub fn new(config: &Config) -> Self {
        Self {
            amount_scale: config.vault.amount_scale,
            call_timeout: config.execution.call_timeout(),
        }
    }

    /// Enter emergency mode and exit every strategy that is not already
    /// blacklisted.
    pub async fn activate(
        &self,
        core: &mut VaultCore,
        reason: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<EmergencyReport> {
        core.ledger.record(
            VaultEventKind::EmergencyActivated {
                reason: reason.to_string(),
            },
            now,
        )?;
        core.monitor.record_emergency(reason);

        let ids: Vec<StrategyId> = core
            .ledger
            .registry()
            .records()
            .filter(|r| r.status != StrategyStatus::Blacklisted)
            .map(|r| r.id.clone())
            .collect();
        let exits = self.exit_many(core, ids, now).await?;

        let report = EmergencyReport {
            reason: reason.to_string(),
            total_recovered: exits.iter().map(|e| e.recovered + e.yield_realized).sum(),
            total_stuck: exits.iter().map(|e| e.stuck).sum(),
            exits,
        };
        info!(
            %reason,
            recovered = %report.total_recovered,
            stuck = %report.total_stuck,
            stuck_strategies = report.stuck_strategies().len(),
            "Emergency exit complete"
        );
        Ok(report)
    }

    /// Leave emergency mode. Capital stays idle until the next rebalance.
    pub fn deactivate(&self, core: &mut VaultCore, now: DateTime<Utc>) -> VaultResult<()> {
        core.ledger.record(VaultEventKind::EmergencyDeactivated, now)?;
        info!("Emergency mode deactivated");
        Ok(())
    }

    /// Exit and blacklist a single strategy.
    pub async fn exit_strategy(
        &self,
        core: &mut VaultCore,
        id: &StrategyId,
        now: DateTime<Utc>,
    ) -> VaultResult<ExitOutcome> {
        core.ledger.registry().get(id)?;
        let mut exits = self.exit_many(core, vec![id.clone()], now).await?;
        Ok(exits.remove(0))
    }

    /// Retry exits for strategies still holding stuck capital.
    pub async fn retry_stuck(
        &self,
        core: &mut VaultCore,
        now: DateTime<Utc>,
    ) -> VaultResult<Vec<ExitOutcome>> {
        let ids: Vec<StrategyId> = core
            .ledger
            .registry()
            .records()
            .filter(|r| r.is_stuck())
            .map(|r| r.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        info!(strategies = ids.len(), "Retrying stuck exits");
        self.exit_many(core, ids, now).await
    }

    async fn exit_many(
        &self,
        core: &mut VaultCore,
        ids: Vec<StrategyId>,
        now: DateTime<Utc>,
    ) -> VaultResult<Vec<ExitOutcome>> {
        let mut allocations = Vec::with_capacity(ids.len());
        for id in &ids {
            core.set_status(id, StrategyStatus::Exiting, now)?;
            allocations.push(core.ledger.registry().get(id)?.allocation);
        }

        let targets = ids.iter().map(|id| core.call_target(id, ())).collect();
        let outcomes = scatter(targets, self.call_timeout, |backend, ()| async move {
            backend.emergency_exit().await
        })
        .await;

        let mut exits = Vec::with_capacity(outcomes.len());
        for ((id, outcome), allocation) in outcomes.into_iter().zip(allocations) {
            let exit = match outcome {
                CallOutcome::Ok(amount) => {
                    core.monitor.record_success(&id);
                    self.settle(core, &id, allocation, amount, now)?
                }
                failed => {
                    error!(%id, %allocation, outcome = %failed, "Emergency exit failed");
                    core.monitor.record_failure(&id, "emergency_exit", &failed);
                    core.set_status(&id, StrategyStatus::StuckCapital, now)?;
                    if allocation > Decimal::ZERO {
                        core.monitor.record_stuck_capital(&id, allocation);
                    }
                    ExitOutcome {
                        strategy_id: id,
                        allocation_before: allocation,
                        recovered: Decimal::ZERO,
                        yield_realized: Decimal::ZERO,
                        stuck: allocation,
                        status: StrategyStatus::StuckCapital,
                        error: Some(failed.to_string()),
                    }
                }
            };
            exits.push(exit);
        }
        Ok(exits)
    }

    /// Book what an exit returned. Anything above the allocation is yield;
    /// any allocation not covered stays flagged as stuck.
    fn settle(
        &self,
        core: &mut VaultCore,
        id: &StrategyId,
        allocation: Decimal,
        returned: Decimal,
        now: DateTime<Utc>,
    ) -> VaultResult<ExitOutcome> {
        let returned = floor_to_scale(returned.max(Decimal::ZERO), self.amount_scale);
        let principal = returned.min(allocation);
        let mut yield_realized = returned - principal;

        if principal > Decimal::ZERO {
            core.ledger.record(
                VaultEventKind::Recalled {
                    strategy_id: id.clone(),
                    amount: principal,
                },
                now,
            )?;
        }
        if yield_realized > Decimal::ZERO {
            if core.ledger.state().total_shares.is_zero() {
                warn!(%id, amount = %yield_realized, "Exit returned yield with no shares outstanding, not booked");
                yield_realized = Decimal::ZERO;
            } else {
                core.ledger.record(
                    VaultEventKind::YieldHarvested {
                        strategy_id: id.clone(),
                        amount: yield_realized,
                    },
                    now,
                )?;
            }
        }

        let stuck = allocation - principal;
        let status = if stuck > Decimal::ZERO {
            warn!(%id, %principal, %stuck, "Partial exit, remainder flagged stuck");
            core.monitor.record_stuck_capital(id, stuck);
            StrategyStatus::StuckCapital
        } else {
            info!(%id, %principal, yield_realized = %yield_realized, "Strategy exited");
            StrategyStatus::Blacklisted
        };
        core.set_status(id, status, now)?;

        Ok(ExitOutcome {
            strategy_id: id.clone(),
            allocation_before: allocation,
            recovered: principal,
            yield_realized,
            stuck,
            status,
            error: None,
        })
    }
}
