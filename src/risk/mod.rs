//! Risk inputs and impairment monitoring.
//!
//! - Risk oracle boundary with fail-safe interpretation
//! - Backend impairment and consistency alerts

mod monitor;
mod oracle;

pub use monitor::{
    AlertSeverity, ImpairmentKind, ImpairmentMonitor, MonitorConfig, VaultAlert,
};
pub use oracle::{RiskAssessment, RiskLevel, RiskOracle, RiskReading, StaticRiskOracle};

#[cfg(test)]
pub use oracle::MockRiskOracle;
