//! Ledger events.
//!
//! Every ledger mutation is one of these. The live ledger and a replayed
//! ledger go through the same apply path, so the event history is the
//! source of truth for VaultState and the strategy table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::strategy::{NewStrategy, StrategyId, StrategyStatus};

/// A timestamped ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: VaultEventKind,
}

impl VaultEvent {
    pub fn new(kind: VaultEventKind, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VaultEventKind {
    StrategyRegistered {
        strategy: NewStrategy,
    },
    /// Assets entered idle and shares were minted
    Deposited {
        depositor: String,
        amount: Decimal,
        shares: Decimal,
    },
    /// Shares were burned and assets left idle
    Withdrawn {
        depositor: String,
        shares: Decimal,
        assets: Decimal,
    },
    /// Idle capital moved into a strategy
    Deployed {
        strategy_id: StrategyId,
        amount: Decimal,
    },
    /// Strategy capital came back to idle
    Recalled {
        strategy_id: StrategyId,
        amount: Decimal,
    },
    /// Realized yield landed in idle
    YieldHarvested {
        strategy_id: StrategyId,
        amount: Decimal,
    },
    MetricsUpdated {
        strategy_id: StrategyId,
        current_yield: Decimal,
        liquidity_depth: Decimal,
        balance: Decimal,
    },
    RiskUpdated {
        strategy_id: StrategyId,
        risk_score: u32,
    },
    StatusChanged {
        strategy_id: StrategyId,
        status: StrategyStatus,
    },
    TargetSet {
        strategy_id: StrategyId,
        target: Decimal,
    },
    Deactivated {
        strategy_id: StrategyId,
    },
    /// Unrecoverable allocation removed from total capital
    WrittenOff {
        strategy_id: StrategyId,
        amount: Decimal,
    },
    EmergencyActivated {
        reason: String,
    },
    EmergencyDeactivated,
    Rebalanced,
    /// Idle drifted below target; next tick rebalances regardless of interval
    RebalanceDue,
    Paused,
    Resumed,
    Halted {
        detail: String,
    },
    HaltCleared,
}

impl VaultEventKind {
    /// Short name stored alongside the payload.
    pub fn name(&self) -> &'static str {
        match self {
            VaultEventKind::StrategyRegistered { .. } => "strategy_registered",
            VaultEventKind::Deposited { .. } => "deposited",
            VaultEventKind::Withdrawn { .. } => "withdrawn",
            VaultEventKind::Deployed { .. } => "deployed",
            VaultEventKind::Recalled { .. } => "recalled",
            VaultEventKind::YieldHarvested { .. } => "yield_harvested",
            VaultEventKind::MetricsUpdated { .. } => "metrics_updated",
            VaultEventKind::RiskUpdated { .. } => "risk_updated",
            VaultEventKind::StatusChanged { .. } => "status_changed",
            VaultEventKind::TargetSet { .. } => "target_set",
            VaultEventKind::Deactivated { .. } => "deactivated",
            VaultEventKind::WrittenOff { .. } => "written_off",
            VaultEventKind::EmergencyActivated { .. } => "emergency_activated",
            VaultEventKind::EmergencyDeactivated => "emergency_deactivated",
            VaultEventKind::Rebalanced => "rebalanced",
            VaultEventKind::RebalanceDue => "rebalance_due",
            VaultEventKind::Paused => "paused",
            VaultEventKind::Resumed => "resumed",
            VaultEventKind::Halted { .. } => "halted",
            VaultEventKind::HaltCleared => "halt_cleared",
        }
    }
}
