//! Strategy catalog with risk, yield and capacity metadata.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{VaultError, VaultResult};

/// Highest risk score the oracle can report.
pub const MAX_RISK_SCORE: u32 = 10_000;

/// Stable strategy identifier. Ordering defines the deterministic iteration
/// order used by every allocation and rebalance pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrategyId(String);

impl StrategyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a strategy.
///
/// `Active` → `Throttled` (risk above ceiling, existing capital kept) →
/// `Exiting` (risk above emergency threshold or manual) → `Blacklisted` on a
/// clean exit, `StuckCapital` when the exit fails or is partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Active,
    Throttled,
    Exiting,
    Blacklisted,
    StuckCapital,
}

impl StrategyStatus {
    /// Whether `self → next` is a legal move.
    pub fn can_transition_to(self, next: StrategyStatus) -> bool {
        use StrategyStatus::*;
        matches!(
            (self, next),
            (Active, Throttled)
                | (Throttled, Active)
                | (Active, Exiting)
                | (Throttled, Exiting)
                | (StuckCapital, Exiting)
                | (Exiting, Blacklisted)
                | (Exiting, StuckCapital)
                | (Active, StuckCapital)
                | (Throttled, StuckCapital)
                | (Active, Blacklisted)
                | (Throttled, Blacklisted)
                | (StuckCapital, Blacklisted)
                | (Blacklisted, Active)
        )
    }

    /// Whether the strategy is excluded from new allocation for good
    /// (until an operator re-enables it).
    pub fn is_blacklisted(self) -> bool {
        matches!(self, StrategyStatus::Blacklisted | StrategyStatus::StuckCapital)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Throttled => "THROTTLED",
            StrategyStatus::Exiting => "EXITING",
            StrategyStatus::Blacklisted => "BLACKLISTED",
            StrategyStatus::StuckCapital => "STUCK_CAPITAL",
        }
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration parameters for a new strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStrategy {
    pub id: StrategyId,
    /// Adapter key resolved through the backend set
    pub backend: String,
    pub protocol: String,
    pub risk_score: u32,
    pub capacity: Decimal,
    pub min_deposit: Decimal,
    /// Initial yield estimate as a fraction (0.05 = 5%)
    pub current_yield: Decimal,
    pub liquidity_depth: Decimal,
}

/// A registered strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub backend: String,
    pub protocol: String,
    /// 0-10000, higher is riskier
    pub risk_score: u32,
    pub current_yield: Decimal,
    pub liquidity_depth: Decimal,
    /// Capital the ledger believes the strategy holds
    pub allocation: Decimal,
    /// Allocation the last plan asked for
    pub target_allocation: Decimal,
    /// Capacity ceiling for this strategy
    pub capacity: Decimal,
    pub min_deposit: Decimal,
    pub status: StrategyStatus,
    /// Cleared by operators; a deactivated strategy is kept but never used
    pub active: bool,
    /// Last balance reported by the backend
    pub last_known_balance: Decimal,
    pub last_update: DateTime<Utc>,
}

impl StrategyRecord {
    /// Whether the strategy may receive new capital.
    pub fn accepts_new_allocation(&self) -> bool {
        self.active && self.status == StrategyStatus::Active
    }

    /// Whether the ledger flags part of this strategy's value as stuck.
    pub fn is_stuck(&self) -> bool {
        self.status == StrategyStatus::StuckCapital && self.allocation > Decimal::ZERO
    }

    /// Yield accrued in the backend beyond the ledger allocation.
    pub fn pending_yield(&self) -> Decimal {
        (self.last_known_balance - self.allocation).max(Decimal::ZERO)
    }
}

/// Signal raised by a risk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskTransition {
    Unchanged,
    /// Risk rose above the ceiling; no new allocation.
    Throttled,
    /// Risk fell back below the ceiling.
    Restored,
    /// Risk crossed the emergency threshold; the strategy must be exited.
    EmergencyExit,
}

/// Catalog of strategies keyed by id.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    records: BTreeMap<StrategyId, StrategyRecord>,
    /// Global per-strategy allocation cap
    max_single_allocation: Decimal,
    /// Risk above which strategies are throttled
    risk_ceiling: u32,
    /// Risk above which strategies are exited
    emergency_exit_threshold: u32,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new(max_single_allocation: Decimal, risk_ceiling: u32, emergency_exit_threshold: u32) -> Self {
        Self {
            records: BTreeMap::new(),
            max_single_allocation,
            risk_ceiling,
            emergency_exit_threshold,
        }
    }

    /// Validate a registration without applying it.
    pub fn check_registration(&self, new: &NewStrategy) -> VaultResult<()> {
        if self.records.contains_key(&new.id) {
            return Err(VaultError::DuplicateStrategy(new.id.clone()));
        }
        if new.risk_score > MAX_RISK_SCORE {
            return Err(VaultError::InvalidRiskScore(new.risk_score));
        }
        if new.capacity <= Decimal::ZERO || new.min_deposit < Decimal::ZERO {
            return Err(VaultError::InvalidAmount(new.capacity.min(new.min_deposit)));
        }
        Ok(())
    }

    /// Add a strategy record.
    pub fn register(&mut self, new: NewStrategy, now: DateTime<Utc>) -> VaultResult<()> {
        self.check_registration(&new)?;

        let status = if new.risk_score > self.risk_ceiling {
            StrategyStatus::Throttled
        } else {
            StrategyStatus::Active
        };

        info!(
            id = %new.id,
            protocol = %new.protocol,
            risk = new.risk_score,
            capacity = %new.capacity,
            %status,
            "Strategy registered"
        );

        self.records.insert(
            new.id.clone(),
            StrategyRecord {
                id: new.id,
                backend: new.backend,
                protocol: new.protocol,
                risk_score: new.risk_score,
                current_yield: new.current_yield,
                liquidity_depth: new.liquidity_depth,
                allocation: Decimal::ZERO,
                target_allocation: Decimal::ZERO,
                capacity: new.capacity,
                min_deposit: new.min_deposit,
                status,
                active: true,
                last_known_balance: Decimal::ZERO,
                last_update: now,
            },
        );
        Ok(())
    }

    /// Active, non-blacklisted strategies that can take `amount` under the
    /// given risk ceiling, in id order.
    pub fn get_eligible(&self, amount: Decimal, risk_ceiling: u32) -> Vec<&StrategyRecord> {
        let eligible: Vec<&StrategyRecord> = self
            .records
            .values()
            .filter(|r| r.accepts_new_allocation())
            .filter(|r| r.risk_score <= risk_ceiling)
            .filter(|r| r.min_deposit <= amount)
            .filter(|r| self.effective_cap(r) > Decimal::ZERO)
            .collect();

        debug!(
            %amount,
            risk_ceiling,
            eligible = eligible.len(),
            total = self.records.len(),
            "Eligible strategies"
        );
        eligible
    }

    /// `min(capacity, global cap)` for a record.
    pub fn effective_cap(&self, record: &StrategyRecord) -> Decimal {
        record.capacity.min(self.max_single_allocation)
    }

    /// Headroom left under the effective cap.
    pub fn headroom(&self, record: &StrategyRecord) -> Decimal {
        (self.effective_cap(record) - record.allocation).max(Decimal::ZERO)
    }

    /// Record a new risk score and derive the status change.
    ///
    /// Crossing the emergency threshold throttles the strategy, but the
    /// registry never exits it; an [`RiskTransition::EmergencyExit`] must be
    /// acted on by the caller.
    pub fn update_risk(
        &mut self,
        id: &StrategyId,
        score: u32,
        now: DateTime<Utc>,
    ) -> VaultResult<RiskTransition> {
        if score > MAX_RISK_SCORE {
            return Err(VaultError::InvalidRiskScore(score));
        }
        let risk_ceiling = self.risk_ceiling;
        let emergency = self.emergency_exit_threshold;
        let record = self.get_mut(id)?;

        let previous = record.risk_score;
        record.risk_score = score;
        record.last_update = now;

        let transition = match record.status {
            StrategyStatus::Active | StrategyStatus::Throttled if score > emergency => {
                record.status = StrategyStatus::Throttled;
                RiskTransition::EmergencyExit
            }
            StrategyStatus::Active if score > risk_ceiling => {
                record.status = StrategyStatus::Throttled;
                RiskTransition::Throttled
            }
            StrategyStatus::Throttled if score <= risk_ceiling => {
                record.status = StrategyStatus::Active;
                RiskTransition::Restored
            }
            _ => RiskTransition::Unchanged,
        };

        match transition {
            RiskTransition::EmergencyExit => warn!(
                %id, previous, score, threshold = emergency,
                "Risk crossed emergency threshold"
            ),
            RiskTransition::Throttled => warn!(
                %id, previous, score, ceiling = risk_ceiling,
                "Strategy throttled"
            ),
            RiskTransition::Restored => info!(%id, previous, score, "Strategy restored"),
            RiskTransition::Unchanged => debug!(%id, previous, score, "Risk updated"),
        }

        Ok(transition)
    }

    /// Move a strategy to `next`, enforcing the state machine.
    pub fn transition(&mut self, id: &StrategyId, next: StrategyStatus) -> VaultResult<()> {
        let record = self.get_mut(id)?;
        if record.status == next {
            return Ok(());
        }
        if !record.status.can_transition_to(next) {
            return Err(VaultError::InvalidTransition {
                id: id.clone(),
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }
        info!(%id, from = %record.status, to = %next, "Strategy status change");
        record.status = next;
        Ok(())
    }

    /// Stop using a strategy without deleting it.
    pub fn deactivate(&mut self, id: &StrategyId) -> VaultResult<()> {
        let record = self.get_mut(id)?;
        record.active = false;
        warn!(%id, "Strategy deactivated");
        Ok(())
    }

    /// Refresh backend-reported figures.
    pub fn record_metrics(
        &mut self,
        id: &StrategyId,
        current_yield: Decimal,
        liquidity_depth: Decimal,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> VaultResult<()> {
        let record = self.get_mut(id)?;
        record.current_yield = current_yield;
        record.liquidity_depth = liquidity_depth;
        record.last_known_balance = balance;
        record.last_update = now;
        Ok(())
    }

    pub fn get(&self, id: &StrategyId) -> VaultResult<&StrategyRecord> {
        self.records
            .get(id)
            .ok_or_else(|| VaultError::UnknownStrategy(id.clone()))
    }

    pub(crate) fn get_mut(&mut self, id: &StrategyId) -> VaultResult<&mut StrategyRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| VaultError::UnknownStrategy(id.clone()))
    }

    pub fn contains(&self, id: &StrategyId) -> bool {
        self.records.contains_key(id)
    }

    /// All records in id order.
    pub fn records(&self) -> impl Iterator<Item = &StrategyRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all ledger allocations.
    pub fn total_allocated(&self) -> Decimal {
        self.records.values().map(|r| r.allocation).sum()
    }

    pub fn risk_ceiling(&self) -> u32 {
        self.risk_ceiling
    }

    pub fn emergency_exit_threshold(&self) -> u32 {
        self.emergency_exit_threshold
    }

    pub fn max_single_allocation(&self) -> Decimal {
        self.max_single_allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_strategy(id: &str, risk: u32, capacity: Decimal, min_deposit: Decimal) -> NewStrategy {
        NewStrategy {
            id: StrategyId::new(id),
            backend: id.to_string(),
            protocol: "lending".to_string(),
            risk_score: risk,
            capacity,
            min_deposit,
            current_yield: dec!(0.05),
            liquidity_depth: dec!(1_000_000),
        }
    }

    fn test_registry() -> StrategyRegistry {
        StrategyRegistry::new(dec!(1_000_000), 5000, 8000)
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = test_registry();
        registry
            .register(new_strategy("aave", 2000, dec!(1000), dec!(0)), Utc::now())
            .unwrap();

        let err = registry
            .register(new_strategy("aave", 1000, dec!(500), dec!(0)), Utc::now())
            .unwrap_err();
        assert_eq!(err, VaultError::DuplicateStrategy(StrategyId::new("aave")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_risk_score_rejected() {
        let mut registry = test_registry();
        let err = registry
            .register(new_strategy("x", 10_001, dec!(1000), dec!(0)), Utc::now())
            .unwrap_err();
        assert_eq!(err, VaultError::InvalidRiskScore(10_001));
    }

    #[test]
    fn test_eligible_filters_and_orders_by_id() {
        let mut registry = test_registry();
        let now = Utc::now();
        registry.register(new_strategy("c-lp", 3000, dec!(1000), dec!(0)), now).unwrap();
        registry.register(new_strategy("a-lend", 2000, dec!(1000), dec!(0)), now).unwrap();
        registry.register(new_strategy("b-risky", 4500, dec!(1000), dec!(0)), now).unwrap();
        registry.register(new_strategy("d-big-min", 1000, dec!(1000), dec!(500)), now).unwrap();

        let ids: Vec<&str> = registry
            .get_eligible(dec!(100), 4000)
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a-lend", "c-lp"]);

        // Same inputs, same answer
        let again: Vec<&str> = registry
            .get_eligible(dec!(100), 4000)
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, again);

        // Minimum deposit admits larger amounts
        assert_eq!(registry.get_eligible(dec!(600), 4000).len(), 3);
    }

    #[test]
    fn test_blacklisted_and_deactivated_not_eligible() {
        let mut registry = test_registry();
        let now = Utc::now();
        registry.register(new_strategy("a", 1000, dec!(1000), dec!(0)), now).unwrap();
        registry.register(new_strategy("b", 1000, dec!(1000), dec!(0)), now).unwrap();

        registry
            .transition(&StrategyId::new("a"), StrategyStatus::Blacklisted)
            .unwrap();
        registry.deactivate(&StrategyId::new("b")).unwrap();

        assert!(registry.get_eligible(dec!(100), 5000).is_empty());

        // Re-enable brings it back
        registry
            .transition(&StrategyId::new("a"), StrategyStatus::Active)
            .unwrap();
        assert_eq!(registry.get_eligible(dec!(100), 5000).len(), 1);
    }

    #[test]
    fn test_full_strategy_still_eligible_for_targets() {
        let mut registry = test_registry();
        let id = StrategyId::new("a");
        registry.register(new_strategy("a", 1000, dec!(1000), dec!(0)), Utc::now()).unwrap();
        registry.get_mut(&id).unwrap().allocation = dec!(1000);

        let record = registry.get(&id).unwrap();
        assert_eq!(registry.headroom(record), Decimal::ZERO);
        // Eligibility is about the cap being open; headroom is checked by the optimizer
        assert_eq!(registry.get_eligible(dec!(1), 5000).len(), 1);
    }

    #[test]
    fn test_effective_cap_uses_global_limit() {
        let mut registry = StrategyRegistry::new(dec!(400), 5000, 8000);
        registry.register(new_strategy("a", 1000, dec!(1000), dec!(0)), Utc::now()).unwrap();
        let record = registry.get(&StrategyId::new("a")).unwrap();
        assert_eq!(registry.effective_cap(record), dec!(400));
    }

    #[test]
    fn test_risk_transitions() {
        let mut registry = test_registry();
        let id = StrategyId::new("a");
        let now = Utc::now();
        registry.register(new_strategy("a", 1000, dec!(1000), dec!(0)), now).unwrap();

        assert_eq!(registry.update_risk(&id, 3000, now).unwrap(), RiskTransition::Unchanged);
        assert_eq!(registry.update_risk(&id, 6000, now).unwrap(), RiskTransition::Throttled);
        assert_eq!(registry.get(&id).unwrap().status, StrategyStatus::Throttled);
        assert_eq!(registry.update_risk(&id, 4000, now).unwrap(), RiskTransition::Restored);
        assert_eq!(registry.get(&id).unwrap().status, StrategyStatus::Active);

        // Above the emergency threshold the registry throttles and signals;
        // the exit itself is left to the caller
        assert_eq!(
            registry.update_risk(&id, 9000, now).unwrap(),
            RiskTransition::EmergencyExit
        );
        assert_eq!(registry.get(&id).unwrap().status, StrategyStatus::Throttled);
        assert_eq!(registry.get(&id).unwrap().risk_score, 9000);
    }

    #[test]
    fn test_register_above_ceiling_starts_throttled() {
        let mut registry = test_registry();
        registry.register(new_strategy("x", 6000, dec!(1000), dec!(0)), Utc::now()).unwrap();
        assert_eq!(
            registry.get(&StrategyId::new("x")).unwrap().status,
            StrategyStatus::Throttled
        );
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut registry = test_registry();
        let id = StrategyId::new("a");
        registry.register(new_strategy("a", 1000, dec!(1000), dec!(0)), Utc::now()).unwrap();

        // Same status is a no-op
        assert!(registry.transition(&id, StrategyStatus::Active).is_ok());

        registry.transition(&id, StrategyStatus::Exiting).unwrap();
        let err = registry.transition(&id, StrategyStatus::Throttled);
        assert!(matches!(err, Err(VaultError::InvalidTransition { .. })));
    }
}
