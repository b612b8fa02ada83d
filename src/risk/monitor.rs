//! Impairment monitoring for strategy backends and ledger consistency.
//!
//! Detects operational issues and turns them into structured alerts:
//! - Backend call failures and timeouts
//! - Consecutive failures per strategy (blacklist threshold)
//! - Capital stuck in a strategy after a failed exit
//! - Risk oracle failures
//! - Ledger consistency violations (halts the vault)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};

use crate::backend::CallOutcome;
use crate::strategy::StrategyId;

/// Kinds of impairment the monitor reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ImpairmentKind {
    /// A backend call returned an error
    BackendFailure {
        strategy_id: StrategyId,
        call: String,
        reason: String,
    },
    /// A backend call did not answer in time
    BackendTimeout {
        strategy_id: StrategyId,
        call: String,
    },
    /// Consecutive failures reached the blacklist threshold
    RepeatedFailures {
        strategy_id: StrategyId,
        consecutive_failures: u32,
    },
    /// Capital could not be recovered from a strategy
    StuckCapital {
        strategy_id: StrategyId,
        amount: Decimal,
    },
    /// Risk oracle failed or returned stale data
    OracleDegraded {
        strategy_id: StrategyId,
        reason: String,
    },
    /// Ledger invariant check failed
    ConsistencyViolation { detail: String },
    /// Global emergency mode switched on
    EmergencyActivated { reason: String },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// Get display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A monitoring alert.
#[derive(Debug, Clone, Serialize)]
pub struct VaultAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ImpairmentKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub suggested_action: String,
}

impl VaultAlert {
    fn new(
        seq: u64,
        kind: ImpairmentKind,
        severity: AlertSeverity,
        message: String,
        suggested_action: String,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            alert_id: format!("vault-{}-{:06}", timestamp.timestamp(), seq),
            timestamp,
            kind,
            severity,
            message,
            suggested_action,
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "vault_alert", "VAULT_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "vault_alert", "VAULT_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "vault_alert", "VAULT_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "vault_alert", "VAULT_ALERT: {}", json),
        }
    }
}

/// Configuration for impairment monitoring.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive failures before a strategy should be blacklisted
    pub max_consecutive_failures: u32,
    /// Alerts kept in memory
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_alerts: 100,
        }
    }
}

/// Tracks backend impairment and ledger health.
#[derive(Debug)]
pub struct ImpairmentMonitor {
    config: MonitorConfig,
    /// Consecutive failure count per strategy
    failure_counts: HashMap<StrategyId, u32>,
    /// Recent alerts, oldest first
    active_alerts: VecDeque<VaultAlert>,
    seq: u64,
}

impl ImpairmentMonitor {
    /// Create a new monitor.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            failure_counts: HashMap::new(),
            active_alerts: VecDeque::new(),
            seq: 0,
        }
    }

    /// Record a failed backend call.
    ///
    /// Returns true once the strategy has failed enough times in a row that
    /// it should be blacklisted.
    pub fn record_failure<T>(
        &mut self,
        strategy_id: &StrategyId,
        call: &str,
        outcome: &CallOutcome<T>,
    ) -> bool {
        let count = self.failure_counts.entry(strategy_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        let kind = match outcome {
            CallOutcome::Impaired(_) => ImpairmentKind::BackendTimeout {
                strategy_id: strategy_id.clone(),
                call: call.to_string(),
            },
            _ => ImpairmentKind::BackendFailure {
                strategy_id: strategy_id.clone(),
                call: call.to_string(),
                reason: outcome.reason().unwrap_or_default().to_string(),
            },
        };
        self.raise(
            kind,
            AlertSeverity::Warning,
            format!("{} on {} {}", call, strategy_id, outcome),
            format!("Check {} backend health", strategy_id),
        );

        let threshold_hit = count >= self.config.max_consecutive_failures;
        if threshold_hit {
            self.raise(
                ImpairmentKind::RepeatedFailures {
                    strategy_id: strategy_id.clone(),
                    consecutive_failures: count,
                },
                AlertSeverity::Error,
                format!(
                    "{} consecutive failures for {} - backend impaired",
                    count, strategy_id
                ),
                format!("Blacklist {} until it recovers", strategy_id),
            );
        }
        threshold_hit
    }

    /// Record a successful call (resets the failure counter).
    pub fn record_success(&mut self, strategy_id: &StrategyId) {
        if let Some(count) = self.failure_counts.get_mut(strategy_id) {
            if *count > 0 {
                debug!(
                    %strategy_id,
                    previous_failures = *count,
                    "Backend success - resetting failure counter"
                );
            }
            *count = 0;
        }
    }

    /// Record capital that could not be recovered.
    pub fn record_stuck_capital(&mut self, strategy_id: &StrategyId, amount: Decimal) {
        self.raise(
            ImpairmentKind::StuckCapital {
                strategy_id: strategy_id.clone(),
                amount,
            },
            AlertSeverity::Error,
            format!("{} still holds {} after a failed exit", strategy_id, amount),
            "Exit is retried every tick; write off manually if unrecoverable".to_string(),
        );
    }

    /// Record an oracle failure or stale answer.
    pub fn record_oracle_degraded(&mut self, strategy_id: &StrategyId, reason: &str) {
        self.raise(
            ImpairmentKind::OracleDegraded {
                strategy_id: strategy_id.clone(),
                reason: reason.to_string(),
            },
            AlertSeverity::Warning,
            format!("Risk oracle degraded for {}: {}", strategy_id, reason),
            "Treating strategy as maximum risk".to_string(),
        );
    }

    /// Record a failed invariant check.
    pub fn record_consistency_violation(&mut self, detail: &str) {
        self.raise(
            ImpairmentKind::ConsistencyViolation {
                detail: detail.to_string(),
            },
            AlertSeverity::Critical,
            format!("Ledger consistency violation: {}", detail),
            "All allocation halted; reconcile ledger and clear halt".to_string(),
        );
    }

    /// Record global emergency activation.
    pub fn record_emergency(&mut self, reason: &str) {
        self.raise(
            ImpairmentKind::EmergencyActivated {
                reason: reason.to_string(),
            },
            AlertSeverity::Critical,
            format!("Emergency mode activated: {}", reason),
            "Review exits and deactivate emergency when safe".to_string(),
        );
    }

    fn raise(
        &mut self,
        kind: ImpairmentKind,
        severity: AlertSeverity,
        message: String,
        suggested_action: String,
    ) {
        self.seq += 1;
        let alert = VaultAlert::new(self.seq, kind, severity, message, suggested_action);
        alert.emit();
        self.active_alerts.push_back(alert);

        while self.active_alerts.len() > self.config.max_alerts {
            self.active_alerts.pop_front();
        }
    }

    /// Get all active alerts, oldest first.
    pub fn get_active_alerts(&self) -> impl Iterator<Item = &VaultAlert> {
        self.active_alerts.iter()
    }

    /// Get failure count for a strategy.
    pub fn failure_count(&self, strategy_id: &StrategyId) -> u32 {
        self.failure_counts.get(strategy_id).copied().unwrap_or(0)
    }

    /// Forget failure history for a strategy (e.g. after re-enable).
    pub fn clear_strategy(&mut self, strategy_id: &StrategyId) {
        self.failure_counts.remove(strategy_id);
    }
}
