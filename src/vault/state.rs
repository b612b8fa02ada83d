//! Vault-level state and reporting types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::strategy::{StrategyId, StrategyStatus};

/// Pool-wide accounting. Per-strategy allocations live on the strategy
/// records in the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultState {
    /// Idle plus deployed capital
    pub total_capital: Decimal,
    /// Capital held by the vault itself
    pub idle: Decimal,
    pub total_shares: Decimal,
    pub emergency: bool,
    /// Set by a consistency violation; cleared only by an operator
    pub halted: bool,
    /// Operator pause; blocks deposits
    pub paused: bool,
    /// Cumulative stuck capital removed from total capital
    pub written_off: Decimal,
    pub last_rebalance: Option<DateTime<Utc>>,
    /// A withdrawal drained idle below target; bypasses the interval gate
    pub rebalance_due: bool,
}

impl VaultState {
    pub fn deployed(&self) -> Decimal {
        self.total_capital - self.idle
    }

    /// Assets per share; 1 before the first deposit.
    pub fn share_price(&self) -> Decimal {
        if self.total_shares.is_zero() {
            Decimal::ONE
        } else {
            self.total_capital / self.total_shares
        }
    }
}

/// A depositor's claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub shares: Decimal,
    pub last_deposit: Option<DateTime<Utc>>,
}

/// Per-strategy line in [`VaultMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAllocation {
    pub strategy_id: StrategyId,
    pub protocol: String,
    pub status: StrategyStatus,
    pub risk_score: u32,
    pub current_yield: Decimal,
    pub allocation: Decimal,
    pub target_allocation: Decimal,
    pub cap: Decimal,
    pub pending_yield: Decimal,
}

/// Snapshot returned by `Vault::get_vault_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultMetrics {
    pub total_capital: Decimal,
    pub total_shares: Decimal,
    pub idle: Decimal,
    pub share_price: Decimal,
    pub allocations: Vec<StrategyAllocation>,
    /// Unharvested yield reported by backends
    pub pending_yield: Decimal,
    /// Allocation-weighted yield of the current deployment
    pub weighted_yield: Decimal,
    pub written_off: Decimal,
    pub emergency: bool,
    pub halted: bool,
    pub paused: bool,
    pub last_rebalance: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_share_price() {
        let mut state = VaultState::default();
        assert_eq!(state.share_price(), Decimal::ONE);

        state.total_capital = dec!(1100);
        state.total_shares = dec!(1000);
        assert_eq!(state.share_price(), dec!(1.1));
    }
}
