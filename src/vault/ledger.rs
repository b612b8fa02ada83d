//! Event-sourced vault ledger.
//!
//! Tracks total capital, the idle buffer, per-strategy allocation (on the
//! registry records) and depositor shares. State only changes through
//! [`VaultLedger::record`], which validates and applies one [`VaultEvent`]
//! and journals it. An event that fails validation leaves the ledger
//! untouched.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, error};

use super::events::{VaultEvent, VaultEventKind};
use super::state::{Position, StrategyAllocation, VaultMetrics, VaultState};
use crate::error::{VaultError, VaultResult};
use crate::strategy::{AllocationOptimizer, StrategyId, StrategyRegistry, StrategyStatus};
use crate::utils::decimal::{floor_to_scale, mul_div_floor};

#[derive(Debug, Clone)]
pub struct VaultLedger {
    state: VaultState,
    registry: StrategyRegistry,
    positions: BTreeMap<String, Position>,
    journal: Vec<VaultEvent>,
    /// Journal entries already handed to the event store
    persisted: usize,
    amount_scale: u32,
}

impl VaultLedger {
    /// Empty ledger over an empty registry.
    pub fn new(registry: StrategyRegistry, amount_scale: u32) -> Self {
        Self {
            state: VaultState::default(),
            registry,
            positions: BTreeMap::new(),
            journal: Vec::new(),
            persisted: 0,
            amount_scale,
        }
    }

    /// Rebuild a ledger from its event history.
    ///
    /// `registry` must be empty; it only carries the cap and risk thresholds.
    pub fn replay(
        registry: StrategyRegistry,
        amount_scale: u32,
        events: impl IntoIterator<Item = VaultEvent>,
    ) -> VaultResult<Self> {
        let mut ledger = Self::new(registry, amount_scale);
        for event in events {
            ledger.apply(&event, false)?;
            ledger.journal.push(event);
        }
        ledger.persisted = ledger.journal.len();
        debug!(events = ledger.persisted, "Ledger replayed");
        Ok(ledger)
    }

    /// Validate, apply and journal one event.
    pub fn record(&mut self, kind: VaultEventKind, now: DateTime<Utc>) -> VaultResult<()> {
        let event = VaultEvent::new(kind, now);
        self.apply(&event, true)?;
        self.journal.push(event);
        Ok(())
    }

    /// Caps are only enforced on new deploys. History deployed under an
    /// earlier cap replays as-is.
    fn apply(&mut self, event: &VaultEvent, enforce_caps: bool) -> VaultResult<()> {
        let ts = event.timestamp;
        match &event.kind {
            VaultEventKind::StrategyRegistered { strategy } => {
                self.registry.register(strategy.clone(), ts)?;
            }
            VaultEventKind::Deposited {
                depositor,
                amount,
                shares,
            } => {
                ensure_positive(*amount)?;
                ensure_positive(*shares)?;
                let total_capital = self
                    .state
                    .total_capital
                    .checked_add(*amount)
                    .ok_or(VaultError::Overflow("total capital"))?;
                let total_shares = self
                    .state
                    .total_shares
                    .checked_add(*shares)
                    .ok_or(VaultError::Overflow("total shares"))?;

                self.state.total_capital = total_capital;
                self.state.total_shares = total_shares;
                self.state.idle += *amount;
                let position = self.positions.entry(depositor.clone()).or_default();
                position.shares += *shares;
                position.last_deposit = Some(ts);
            }
            VaultEventKind::Withdrawn {
                depositor,
                shares,
                assets,
            } => {
                ensure_positive(*shares)?;
                let held = self.position_shares(depositor);
                if *shares > held {
                    return Err(VaultError::InsufficientShares {
                        requested: *shares,
                        available: held,
                    });
                }
                if *assets < Decimal::ZERO {
                    return Err(VaultError::InvalidAmount(*assets));
                }
                if *assets > self.state.idle {
                    return Err(VaultError::InsufficientLiquidity {
                        needed: *assets,
                        available: self.state.idle,
                    });
                }

                self.state.idle -= *assets;
                self.state.total_capital -= *assets;
                self.state.total_shares -= *shares;
                if let Some(position) = self.positions.get_mut(depositor) {
                    position.shares -= *shares;
                    if position.shares.is_zero() {
                        self.positions.remove(depositor);
                    }
                }
            }
            VaultEventKind::Deployed {
                strategy_id,
                amount,
            } => {
                ensure_positive(*amount)?;
                if *amount > self.state.idle {
                    return Err(VaultError::InsufficientLiquidity {
                        needed: *amount,
                        available: self.state.idle,
                    });
                }
                let headroom = self.registry.headroom(self.registry.get(strategy_id)?);
                if enforce_caps && *amount > headroom {
                    return Err(VaultError::CapacityExceeded(format!(
                        "{} has {} headroom, asked to take {}",
                        strategy_id, headroom, amount
                    )));
                }

                let record = self.registry.get_mut(strategy_id)?;
                record.allocation += *amount;
                record.last_known_balance += *amount;
                self.state.idle -= *amount;
            }
            VaultEventKind::Recalled {
                strategy_id,
                amount,
            } => {
                ensure_positive(*amount)?;
                let record = self.registry.get_mut(strategy_id)?;
                if *amount > record.allocation {
                    return Err(VaultError::InsufficientLiquidity {
                        needed: *amount,
                        available: record.allocation,
                    });
                }
                record.allocation -= *amount;
                record.last_known_balance = (record.last_known_balance - *amount).max(Decimal::ZERO);
                self.state.idle += *amount;
            }
            VaultEventKind::YieldHarvested {
                strategy_id,
                amount,
            } => {
                ensure_positive(*amount)?;
                if self.state.total_shares.is_zero() {
                    return Err(VaultError::InvalidAmount(*amount));
                }
                let record = self.registry.get_mut(strategy_id)?;
                record.last_known_balance = (record.last_known_balance - *amount).max(record.allocation);
                self.state.idle += *amount;
                self.state.total_capital += *amount;
            }
            VaultEventKind::MetricsUpdated {
                strategy_id,
                current_yield,
                liquidity_depth,
                balance,
            } => {
                self.registry.record_metrics(
                    strategy_id,
                    *current_yield,
                    *liquidity_depth,
                    *balance,
                    ts,
                )?;
            }
            VaultEventKind::RiskUpdated {
                strategy_id,
                risk_score,
            } => {
                self.registry.update_risk(strategy_id, *risk_score, ts)?;
            }
            VaultEventKind::StatusChanged {
                strategy_id,
                status,
            } => {
                self.registry.transition(strategy_id, *status)?;
            }
            VaultEventKind::TargetSet {
                strategy_id,
                target,
            } => {
                self.registry.get_mut(strategy_id)?.target_allocation = *target;
            }
            VaultEventKind::Deactivated { strategy_id } => {
                self.registry.deactivate(strategy_id)?;
            }
            VaultEventKind::WrittenOff {
                strategy_id,
                amount,
            } => {
                ensure_positive(*amount)?;
                let record = self.registry.get_mut(strategy_id)?;
                if record.status != StrategyStatus::StuckCapital || *amount > record.allocation {
                    return Err(VaultError::InvalidAmount(*amount));
                }
                record.allocation -= *amount;
                record.last_known_balance = (record.last_known_balance - *amount).max(Decimal::ZERO);
                self.state.total_capital -= *amount;
                self.state.written_off += *amount;
            }
            VaultEventKind::EmergencyActivated { .. } => self.state.emergency = true,
            VaultEventKind::EmergencyDeactivated => self.state.emergency = false,
            VaultEventKind::Rebalanced => {
                self.state.last_rebalance = Some(ts);
                self.state.rebalance_due = false;
            }
            VaultEventKind::RebalanceDue => self.state.rebalance_due = true,
            VaultEventKind::Paused => self.state.paused = true,
            VaultEventKind::Resumed => self.state.paused = false,
            VaultEventKind::Halted { .. } => {
                self.state.halted = true;
                self.state.emergency = true;
            }
            VaultEventKind::HaltCleared => self.state.halted = false,
        }
        Ok(())
    }

    /// Shares minted for a deposit of `amount`.
    ///
    /// 1:1 only while no shares exist; afterwards pro rata, floored.
    pub fn preview_deposit(&self, amount: Decimal) -> VaultResult<Decimal> {
        if self.state.total_shares.is_zero() {
            return Ok(floor_to_scale(amount, self.amount_scale));
        }
        if self.state.total_capital.is_zero() {
            return Err(VaultError::CapacityExceeded(
                "outstanding shares have no backing capital".to_string(),
            ));
        }
        mul_div_floor(
            amount,
            self.state.total_shares,
            self.state.total_capital,
            self.amount_scale,
        )
        .ok_or(VaultError::Overflow("share mint"))
    }

    /// Assets paid for redeeming `shares`.
    ///
    /// Redeeming every outstanding share pays out all remaining capital.
    pub fn preview_redeem(&self, shares: Decimal) -> VaultResult<Decimal> {
        if self.state.total_shares.is_zero() {
            return Ok(Decimal::ZERO);
        }
        if shares == self.state.total_shares {
            return Ok(self.state.total_capital);
        }
        mul_div_floor(
            shares,
            self.state.total_capital,
            self.state.total_shares,
            self.amount_scale,
        )
        .ok_or(VaultError::Overflow("share burn"))
    }

    /// Verify the accounting invariants.
    ///
    /// Caps are not checked here: a lowered cap leaves allocations above it
    /// until the next rebalance. See [`VaultLedger::over_cap`].
    pub fn check_invariants(&self) -> VaultResult<()> {
        let state = &self.state;
        let allocated = self.registry.total_allocated();

        if allocated + state.idle != state.total_capital {
            return Err(self.violation(format!(
                "allocated {} + idle {} != total capital {}",
                allocated, state.idle, state.total_capital
            )));
        }
        if state.idle < Decimal::ZERO {
            return Err(self.violation(format!("negative idle buffer {}", state.idle)));
        }
        for record in self.registry.records() {
            if record.allocation < Decimal::ZERO {
                return Err(self.violation(format!(
                    "{} has negative allocation {}",
                    record.id, record.allocation
                )));
            }
        }
        if state.total_shares.is_zero() && !state.total_capital.is_zero() {
            return Err(self.violation(format!(
                "{} capital with no shares outstanding",
                state.total_capital
            )));
        }
        if state.total_capital.is_zero()
            && !state.total_shares.is_zero()
            && state.written_off.is_zero()
        {
            return Err(self.violation(format!(
                "{} shares outstanding with no capital",
                state.total_shares
            )));
        }
        let position_shares: Decimal = self.positions.values().map(|p| p.shares).sum();
        if position_shares != state.total_shares {
            return Err(self.violation(format!(
                "positions hold {} shares, ledger shows {}",
                position_shares, state.total_shares
            )));
        }
        Ok(())
    }

    fn violation(&self, detail: String) -> VaultError {
        error!(%detail, "Ledger invariant violated");
        VaultError::ConsistencyViolation(detail)
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> VaultMetrics {
        let allocations: Vec<StrategyAllocation> = self
            .registry
            .records()
            .map(|r| StrategyAllocation {
                strategy_id: r.id.clone(),
                protocol: r.protocol.clone(),
                status: r.status,
                risk_score: r.risk_score,
                current_yield: r.current_yield,
                allocation: r.allocation,
                target_allocation: r.target_allocation,
                cap: self.registry.effective_cap(r),
                pending_yield: r.pending_yield(),
            })
            .collect();
        let pending_yield = allocations.iter().map(|a| a.pending_yield).sum();

        VaultMetrics {
            total_capital: self.state.total_capital,
            total_shares: self.state.total_shares,
            idle: self.state.idle,
            share_price: self.state.share_price(),
            allocations,
            pending_yield,
            weighted_yield: AllocationOptimizer::current_weighted_yield(&self.registry),
            written_off: self.state.written_off,
            emergency: self.state.emergency,
            halted: self.state.halted,
            paused: self.state.paused,
            last_rebalance: self.state.last_rebalance,
        }
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn position(&self, depositor: &str) -> Option<&Position> {
        self.positions.get(depositor)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.positions.iter()
    }

    pub fn position_shares(&self, depositor: &str) -> Decimal {
        self.positions
            .get(depositor)
            .map(|p| p.shares)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn amount_scale(&self) -> u32 {
        self.amount_scale
    }

    /// Strategies holding more than their current effective cap.
    pub fn over_cap(&self) -> Vec<StrategyId> {
        self.registry
            .records()
            .filter(|r| r.allocation > self.registry.effective_cap(r))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Full event history, oldest first.
    pub fn journal(&self) -> &[VaultEvent] {
        &self.journal
    }

    /// Events not yet written to the event store.
    pub fn unpersisted(&self) -> &[VaultEvent] {
        &self.journal[self.persisted..]
    }

    /// Mark `count` further events as stored.
    pub fn mark_persisted(&mut self, count: usize) {
        self.persisted = (self.persisted + count).min(self.journal.len());
    }
}

fn ensure_positive(amount: Decimal) -> VaultResult<()> {
    if amount <= Decimal::ZERO {
        return Err(VaultError::InvalidAmount(amount));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::NewStrategy;
    use rust_decimal_macros::dec;

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new(dec!(600), 5000, 8000)
    }

    fn ledger_with_strategy() -> VaultLedger {
        let mut ledger = VaultLedger::new(registry(), 6);
        ledger
            .record(
                VaultEventKind::StrategyRegistered {
                    strategy: NewStrategy {
                        id: StrategyId::new("aave"),
                        backend: "aave".to_string(),
                        protocol: "lending".to_string(),
                        risk_score: 2000,
                        capacity: dec!(1000),
                        min_deposit: dec!(0),
                        current_yield: dec!(0.05),
                        liquidity_depth: dec!(1_000_000),
                    },
                },
                Utc::now(),
            )
            .unwrap();
        ledger
    }

    fn deposit(ledger: &mut VaultLedger, who: &str, amount: Decimal) -> Decimal {
        let shares = ledger.preview_deposit(amount).unwrap();
        ledger
            .record(
                VaultEventKind::Deposited {
                    depositor: who.to_string(),
                    amount,
                    shares,
                },
                Utc::now(),
            )
            .unwrap();
        shares
    }

    #[test]
    fn test_genesis_deposit_is_one_to_one() {
        let mut ledger = ledger_with_strategy();
        assert_eq!(deposit(&mut ledger, "alice", dec!(1000)), dec!(1000));
        assert_eq!(ledger.state().idle, dec!(1000));
        assert_eq!(ledger.position_shares("alice"), dec!(1000));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_shares_priced_after_yield() {
        let mut ledger = ledger_with_strategy();
        deposit(&mut ledger, "alice", dec!(1000));
        let id = StrategyId::new("aave");
        ledger
            .record(
                VaultEventKind::YieldHarvested {
                    strategy_id: id,
                    amount: dec!(100),
                },
                Utc::now(),
            )
            .unwrap();

        // 1100 capital over 1000 shares
        assert_eq!(deposit(&mut ledger, "bob", dec!(110)), dec!(100));
        assert_eq!(ledger.preview_redeem(dec!(100)).unwrap(), dec!(110));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_last_redeem_takes_all_capital() {
        let mut ledger = ledger_with_strategy();
        deposit(&mut ledger, "alice", dec!(1000));
        deposit(&mut ledger, "bob", dec!(333.333333));
        assert_eq!(
            ledger.preview_redeem(ledger.state().total_shares).unwrap(),
            ledger.state().total_capital
        );
    }

    #[test]
    fn test_deploy_beyond_cap_rejected_without_change() {
        let mut ledger = ledger_with_strategy();
        deposit(&mut ledger, "alice", dec!(1000));
        let before = ledger.state().clone();

        // global cap is 600
        let err = ledger
            .record(
                VaultEventKind::Deployed {
                    strategy_id: StrategyId::new("aave"),
                    amount: dec!(700),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::CapacityExceeded(_)));
        assert_eq!(ledger.state(), &before);
        assert_eq!(ledger.journal().len(), 2);
    }

    #[test]
    fn test_withdraw_more_than_held_rejected() {
        let mut ledger = ledger_with_strategy();
        deposit(&mut ledger, "alice", dec!(100));
        let err = ledger
            .record(
                VaultEventKind::Withdrawn {
                    depositor: "alice".to_string(),
                    shares: dec!(150),
                    assets: dec!(150),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            VaultError::InsufficientShares {
                requested: dec!(150),
                available: dec!(100)
            }
        );
    }

    #[test]
    fn test_write_off_keeps_sum_invariant() {
        let mut ledger = ledger_with_strategy();
        let id = StrategyId::new("aave");
        deposit(&mut ledger, "alice", dec!(500));
        let now = Utc::now();
        ledger
            .record(
                VaultEventKind::Deployed {
                    strategy_id: id.clone(),
                    amount: dec!(500),
                },
                now,
            )
            .unwrap();
        ledger
            .record(
                VaultEventKind::StatusChanged {
                    strategy_id: id.clone(),
                    status: StrategyStatus::StuckCapital,
                },
                now,
            )
            .unwrap();
        ledger
            .record(
                VaultEventKind::WrittenOff {
                    strategy_id: id,
                    amount: dec!(500),
                },
                now,
            )
            .unwrap();

        assert_eq!(ledger.state().total_capital, Decimal::ZERO);
        assert_eq!(ledger.state().total_shares, dec!(500));
        assert_eq!(ledger.state().written_off, dec!(500));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_replay_reproduces_state() {
        let mut ledger = ledger_with_strategy();
        let id = StrategyId::new("aave");
        deposit(&mut ledger, "alice", dec!(1000));
        deposit(&mut ledger, "bob", dec!(250));
        let now = Utc::now();
        ledger
            .record(
                VaultEventKind::Deployed {
                    strategy_id: id.clone(),
                    amount: dec!(600),
                },
                now,
            )
            .unwrap();
        ledger
            .record(
                VaultEventKind::RiskUpdated {
                    strategy_id: id.clone(),
                    risk_score: 6000,
                },
                now,
            )
            .unwrap();
        ledger
            .record(
                VaultEventKind::Recalled {
                    strategy_id: id,
                    amount: dec!(200),
                },
                now,
            )
            .unwrap();

        let replayed =
            VaultLedger::replay(registry(), 6, ledger.journal().iter().cloned()).unwrap();
        assert_eq!(replayed.state(), ledger.state());
        assert_eq!(
            replayed.registry().records().cloned().collect::<Vec<_>>(),
            ledger.registry().records().cloned().collect::<Vec<_>>()
        );
        assert_eq!(replayed.position_shares("bob"), dec!(250));
        assert!(replayed.unpersisted().is_empty());
        assert_eq!(
            replayed.registry().get(&StrategyId::new("aave")).unwrap().status,
            StrategyStatus::Throttled
        );
    }

    #[test]
    fn test_replay_under_lowered_cap() {
        let mut ledger = ledger_with_strategy();
        let id = StrategyId::new("aave");
        deposit(&mut ledger, "alice", dec!(1000));
        ledger
            .record(
                VaultEventKind::Deployed {
                    strategy_id: id.clone(),
                    amount: dec!(500),
                },
                Utc::now(),
            )
            .unwrap();
        assert!(ledger.over_cap().is_empty());

        let lowered = StrategyRegistry::new(dec!(400), 5000, 8000);
        let replayed = VaultLedger::replay(lowered, 6, ledger.journal().iter().cloned()).unwrap();
        assert_eq!(replayed.state(), ledger.state());
        assert_eq!(replayed.registry().get(&id).unwrap().allocation, dec!(500));
        assert_eq!(replayed.over_cap(), vec![id.clone()]);
        replayed.check_invariants().unwrap();

        // New deploys still respect the lowered cap
        let mut replayed = replayed;
        let err = replayed
            .record(
                VaultEventKind::Deployed {
                    strategy_id: id,
                    amount: dec!(1),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::CapacityExceeded(_)));
    }

    #[test]
    fn test_invariant_check_detects_bad_positions() {
        let mut ledger = ledger_with_strategy();
        deposit(&mut ledger, "alice", dec!(100));
        ledger.state.total_shares = dec!(90);
        assert!(matches!(
            ledger.check_invariants(),
            Err(VaultError::ConsistencyViolation(_))
        ));
    }
}
