//! Backend-agnostic capability trait for yield strategies.
//!
//! Every pluggable backend (lending market, LP position, staking wrapper,
//! hedge) is driven through the same [`StrategyCapability`] contract. The
//! vault never inspects the concrete adapter type; the strategy record names
//! an adapter key and the [`BackendSet`](super::BackendSet) resolves it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market data a backend reports about itself for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendMetrics {
    /// Current annualized yield as a fraction (0.05 = 5%)
    pub apy: Decimal,
    /// Depth of the underlying market in asset units
    pub liquidity_depth: Decimal,
}

impl BackendMetrics {
    pub fn new(apy: Decimal, liquidity_depth: Decimal) -> Self {
        Self {
            apy,
            liquidity_depth,
        }
    }
}

/// Contract every yield backend implements.
///
/// Any call may fail (timeout, paused protocol). A failure means the strategy
/// is temporarily impaired; callers must never treat it as fatal.
#[async_trait]
pub trait StrategyCapability: Send + Sync {
    /// Accept `amount` of capital. Must be reflected by [`get_balance`](Self::get_balance).
    async fn deploy(&self, amount: Decimal) -> anyhow::Result<()>;

    /// Release up to `amount`; returns what was actually released.
    async fn withdraw(&self, amount: Decimal) -> anyhow::Result<Decimal>;

    /// Realize accrued yield. Idempotent; returns zero when nothing is pending.
    async fn harvest(&self) -> anyhow::Result<Decimal>;

    /// Best-effort full unwind. Returns the recovered amount, reporting zero
    /// rather than erroring when the unwind only partially succeeds.
    async fn emergency_exit(&self) -> anyhow::Result<Decimal>;

    /// Current marked value held by the backend.
    async fn get_balance(&self) -> anyhow::Result<Decimal>;

    /// Current yield and liquidity figures.
    async fn metrics(&self) -> anyhow::Result<BackendMetrics>;
}
