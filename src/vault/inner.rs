//! State guarded by the vault's single-writer lock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, warn};

use super::events::VaultEventKind;
use super::ledger::VaultLedger;
use crate::backend::{BackendSet, CallOutcome, CallTarget};
use crate::error::VaultResult;
use crate::risk::ImpairmentMonitor;
use crate::strategy::{StrategyId, StrategyStatus};

/// Everything an operation mutates: the ledger, the adapters it calls, the
/// impairment record and the rail custody figure.
pub struct VaultCore {
    pub ledger: VaultLedger,
    pub backends: BackendSet,
    pub monitor: ImpairmentMonitor,
    /// Balance the funds rail last confirmed holding for the vault
    pub custody: Decimal,
}

impl VaultCore {
    pub fn new(ledger: VaultLedger, backends: BackendSet, monitor: ImpairmentMonitor) -> Self {
        let custody = ledger.state().idle;
        Self {
            ledger,
            backends,
            monitor,
            custody,
        }
    }

    /// Resolve the adapter for `id` into a dispatchable call.
    pub fn call_target<A>(&self, id: &StrategyId, arg: A) -> CallTarget<A> {
        let backend = self
            .ledger
            .registry()
            .get(id)
            .ok()
            .and_then(|record| self.backends.get(&record.backend));
        CallTarget {
            id: id.clone(),
            backend,
            arg,
        }
    }

    /// Record a status change if it differs from the current one.
    pub fn set_status(
        &mut self,
        id: &StrategyId,
        status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> VaultResult<()> {
        if self.ledger.registry().get(id)?.status == status {
            return Ok(());
        }
        self.ledger.record(
            VaultEventKind::StatusChanged {
                strategy_id: id.clone(),
                status,
            },
            now,
        )
    }

    /// Record a failed backend call and blacklist the strategy once it hits
    /// the consecutive failure threshold. Returns whether it was blacklisted.
    ///
    /// A strategy still holding capital is flagged `StuckCapital` instead of
    /// `Blacklisted` so its exit is retried.
    pub fn note_failure<T>(
        &mut self,
        id: &StrategyId,
        call: &str,
        outcome: &CallOutcome<T>,
        now: DateTime<Utc>,
    ) -> VaultResult<bool> {
        let threshold_hit = self.monitor.record_failure(id, call, outcome);
        if !threshold_hit {
            return Ok(false);
        }

        let record = self.ledger.registry().get(id)?;
        if record.status.is_blacklisted() {
            return Ok(false);
        }
        let allocation = record.allocation;
        if allocation > Decimal::ZERO {
            warn!(%id, %allocation, "Impaired strategy still holds capital, flagging stuck");
            self.set_status(id, StrategyStatus::StuckCapital, now)?;
            self.monitor.record_stuck_capital(id, allocation);
        } else {
            warn!(%id, "Impaired strategy blacklisted");
            self.set_status(id, StrategyStatus::Blacklisted, now)?;
        }
        Ok(true)
    }

    /// Halt after a failed invariant check.
    pub fn halt(&mut self, detail: &str, now: DateTime<Utc>) {
        self.monitor.record_consistency_violation(detail);
        if let Err(e) = self.ledger.record(
            VaultEventKind::Halted {
                detail: detail.to_string(),
            },
            now,
        ) {
            error!(error = %e, "Failed to record halt");
        }
    }
}
