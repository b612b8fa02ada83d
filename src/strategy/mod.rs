//! Strategy catalog and capital movement.
//!
//! - `registry`: strategy records, caps and the status state machine
//! - `allocator`: risk-adjusted target allocation
//! - `rebalancer`: drift detection, rebalancing and proportional recall
//! - `emergency`: strategy exits and stuck capital handling

mod allocator;
mod emergency;
mod rebalancer;
mod registry;

pub use allocator::{AllocationOptimizer, AllocationPlan, PlannedAllocation};
pub use emergency::{EmergencyController, EmergencyReport, ExitOutcome};
pub use rebalancer::{RebalanceController, RebalanceReport};
pub use registry::{
    NewStrategy, RiskTransition, StrategyId, StrategyRecord, StrategyRegistry, StrategyStatus,
    MAX_RISK_SCORE,
};
