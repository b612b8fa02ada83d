//! Vault error taxonomy.
//!
//! Every error carries an [`ErrorClass`] so callers can tell a rejected
//! request apart from an impaired backend or a ledger inconsistency.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::strategy::StrategyId;

/// Broad classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or a request the vault is not accepting right now.
    Validation,
    /// A strategy, vault or depositor limit would be exceeded.
    Capacity,
    /// A backend call failed or timed out.
    ExternalCall,
    /// A ledger invariant no longer holds. Requires operator intervention.
    Consistency,
}

/// Errors returned by vault operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaultError {
    #[error("Strategy {0} is already registered")]
    DuplicateStrategy(StrategyId),

    #[error("Unknown strategy {0}")]
    UnknownStrategy(StrategyId),

    #[error("No adapter registered for backend {0}")]
    UnknownBackend(String),

    #[error("Risk score {0} is outside 0..=10000")]
    InvalidRiskScore(u32),

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Deposit {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },

    #[error("Deposit {amount} is above the maximum of {maximum}")]
    AboveMaximum { amount: Decimal, maximum: Decimal },

    #[error("Asset {0} is not accepted by this vault")]
    AssetNotAccepted(String),

    #[error("Router is inactive")]
    RouterInactive,

    #[error("Emergency mode is active")]
    EmergencyActive,

    #[error("Caller {0} is not an operator")]
    Unauthorized(String),

    #[error("Strategy {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: StrategyId,
        from: String,
        to: String,
    },

    #[error("Insufficient shares: requested {requested}, available {available}")]
    InsufficientShares {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Insufficient liquidity: needed {needed}, available {available}")]
    InsufficientLiquidity { needed: Decimal, available: Decimal },

    #[error("Vault capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("A rebalance or emergency operation is already in progress")]
    RebalanceInProgress,

    #[error("Funds rail call failed: {0}")]
    RailFailure(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Vault is halted after a consistency violation")]
    Halted,
}

impl VaultError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            VaultError::DuplicateStrategy(_)
            | VaultError::UnknownStrategy(_)
            | VaultError::UnknownBackend(_)
            | VaultError::InvalidRiskScore(_)
            | VaultError::InvalidAmount(_)
            | VaultError::BelowMinimum { .. }
            | VaultError::AboveMaximum { .. }
            | VaultError::AssetNotAccepted(_)
            | VaultError::RouterInactive
            | VaultError::EmergencyActive
            | VaultError::Unauthorized(_)
            | VaultError::InvalidTransition { .. }
            | VaultError::RebalanceInProgress => ErrorClass::Validation,

            VaultError::InsufficientShares { .. }
            | VaultError::InsufficientLiquidity { .. }
            | VaultError::CapacityExceeded(_)
            | VaultError::Overflow(_) => ErrorClass::Capacity,

            VaultError::RailFailure(_) => ErrorClass::ExternalCall,

            VaultError::ConsistencyViolation(_) | VaultError::Halted => ErrorClass::Consistency,
        }
    }

    /// Whether this error halts the vault.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            VaultError::BelowMinimum {
                amount: dec!(1),
                minimum: dec!(10)
            }
            .class(),
            ErrorClass::Validation
        );
        assert_eq!(
            VaultError::InsufficientLiquidity {
                needed: dec!(5),
                available: dec!(1)
            }
            .class(),
            ErrorClass::Capacity
        );
        assert_eq!(
            VaultError::RailFailure("timeout".into()).class(),
            ErrorClass::ExternalCall
        );
        assert!(VaultError::ConsistencyViolation("sum".into()).is_fatal());
        assert!(!VaultError::RebalanceInProgress.is_fatal());
    }
}
