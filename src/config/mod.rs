//! Configuration management for the yield router.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vault-level deposit rules and buffer targets
    #[serde(default)]
    pub vault: VaultConfig,
    /// Optimizer scoring and caps
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// Rebalance triggers
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Risk thresholds and impairment handling
    #[serde(default)]
    pub risk: RiskConfig,
    /// Backend call parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Event store location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Symbol of the only asset the vault accepts
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    /// Minimum single deposit
    #[serde(default = "default_min_deposit")]
    pub min_deposit: Decimal,
    /// Maximum single deposit
    #[serde(default = "default_max_deposit")]
    pub max_deposit: Decimal,
    /// Share of total capital kept idle for withdrawals (0.0-1.0)
    #[serde(default = "default_idle_buffer_ratio")]
    pub idle_buffer_ratio: Decimal,
    /// Idle ratio drift above/below target that triggers an allocation pass (0.0-1.0)
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: Decimal,
    /// Decimal places kept for amounts and shares
    #[serde(default = "default_amount_scale")]
    pub amount_scale: u32,
    /// Deploy excess idle capital right after a deposit
    #[serde(default = "default_auto_deploy")]
    pub auto_deploy_on_deposit: bool,
    /// Callers allowed to run operator actions
    #[serde(default = "default_operators")]
    pub operators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Highest risk score a strategy may carry and still receive allocation
    #[serde(default = "default_risk_ceiling")]
    pub risk_ceiling: u32,
    /// Global cap on any single strategy's allocation (asset units)
    #[serde(default = "default_max_single_allocation")]
    pub max_single_allocation: Decimal,
    /// Liquidity depth above which the liquidity bonus applies
    #[serde(default = "default_large_liquidity_threshold")]
    pub large_liquidity_threshold: Decimal,
    /// Score multiplier for deep-liquidity strategies (>= 1.10)
    #[serde(default = "default_liquidity_bonus")]
    pub liquidity_bonus: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Minimum seconds between periodic rebalances
    #[serde(default = "default_min_rebalance_interval")]
    pub min_interval_secs: u64,
    /// Required yield improvement in basis points before moving capital
    #[serde(default = "default_rebalance_threshold_bps")]
    pub threshold_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk score above which a strategy is exited and blacklisted
    #[serde(default = "default_emergency_exit_threshold")]
    pub emergency_exit_threshold: u32,
    /// Oracle responses older than this are treated as maximum risk
    #[serde(default = "default_oracle_staleness")]
    pub oracle_staleness_secs: u64,
    /// Consecutive backend failures before a strategy is blacklisted
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for every backend and oracle call in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite event store
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_base_asset() -> String {
    "USDC".to_string()
}

fn default_min_deposit() -> Decimal {
    Decimal::new(1, 0) // 1 unit
}

fn default_max_deposit() -> Decimal {
    Decimal::new(10_000_000, 0)
}

fn default_idle_buffer_ratio() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_drift_threshold() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_amount_scale() -> u32 {
    6
}

fn default_auto_deploy() -> bool {
    true
}

fn default_operators() -> Vec<String> {
    vec!["operator".to_string()]
}

fn default_risk_ceiling() -> u32 {
    5000
}

fn default_max_single_allocation() -> Decimal {
    Decimal::new(5_000_000, 0)
}

fn default_large_liquidity_threshold() -> Decimal {
    Decimal::new(10_000_000, 0) // $10M depth
}

fn default_liquidity_bonus() -> Decimal {
    Decimal::new(110, 2) // 1.10x
}

fn default_min_rebalance_interval() -> u64 {
    6 * 60 * 60 // 6 hours
}

fn default_rebalance_threshold_bps() -> u32 {
    50
}

fn default_emergency_exit_threshold() -> u32 {
    8000
}

fn default_oracle_staleness() -> u64 {
    60 * 60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_db_path() -> String {
    "data/vault_events.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("YR"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.vault.min_deposit > Decimal::ZERO && self.vault.min_deposit <= self.vault.max_deposit,
            "min_deposit must be positive and <= max_deposit"
        );

        anyhow::ensure!(
            self.vault.idle_buffer_ratio >= Decimal::ZERO
                && self.vault.idle_buffer_ratio < Decimal::ONE,
            "idle_buffer_ratio must be in [0, 1)"
        );

        anyhow::ensure!(
            self.vault.drift_threshold > Decimal::ZERO && self.vault.drift_threshold <= Decimal::ONE,
            "drift_threshold must be in (0, 1]"
        );

        anyhow::ensure!(
            self.vault.amount_scale <= 18,
            "amount_scale must be <= 18"
        );

        anyhow::ensure!(
            self.allocation.risk_ceiling <= 10_000
                && self.risk.emergency_exit_threshold <= 10_000,
            "risk scores are bounded by 10000"
        );

        anyhow::ensure!(
            self.allocation.risk_ceiling < self.risk.emergency_exit_threshold,
            "risk_ceiling must be below emergency_exit_threshold"
        );

        anyhow::ensure!(
            self.allocation.liquidity_bonus >= Decimal::new(110, 2),
            "liquidity_bonus must be at least 1.10"
        );

        anyhow::ensure!(
            self.allocation.max_single_allocation > Decimal::ZERO,
            "max_single_allocation must be positive"
        );

        anyhow::ensure!(
            self.execution.call_timeout_ms > 0,
            "call_timeout_ms must be positive"
        );

        anyhow::ensure!(
            !self.vault.operators.is_empty(),
            "at least one operator must be configured"
        );

        Ok(())
    }
}

impl ExecutionConfig {
    /// Backend call timeout as a [`Duration`].
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            allocation: AllocationConfig::default(),
            rebalance: RebalanceConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            base_asset: default_base_asset(),
            min_deposit: default_min_deposit(),
            max_deposit: default_max_deposit(),
            idle_buffer_ratio: default_idle_buffer_ratio(),
            drift_threshold: default_drift_threshold(),
            amount_scale: default_amount_scale(),
            auto_deploy_on_deposit: default_auto_deploy(),
            operators: default_operators(),
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            risk_ceiling: default_risk_ceiling(),
            max_single_allocation: default_max_single_allocation(),
            large_liquidity_threshold: default_large_liquidity_threshold(),
            liquidity_bonus: default_liquidity_bonus(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_rebalance_interval(),
            threshold_bps: default_rebalance_threshold_bps(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            emergency_exit_threshold: default_emergency_exit_threshold(),
            oracle_staleness_secs: default_oracle_staleness(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ceiling_above_emergency_threshold_rejected() {
        let mut config = Config::default();
        config.allocation.risk_ceiling = 9000;
        config.risk.emergency_exit_threshold = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_liquidity_bonus_floor() {
        let mut config = Config::default();
        config.allocation.liquidity_bonus = Decimal::new(105, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_call_timeout_duration() {
        let config = ExecutionConfig { call_timeout_ms: 250 };
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
    }
}
