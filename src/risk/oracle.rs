//! Risk oracle boundary.
//!
//! The oracle is untrusted and latency-bearing. Anything other than a fresh,
//! approved answer collapses to maximum risk.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::backend::CallOutcome;
use crate::strategy::{StrategyId, MAX_RISK_SCORE};

/// Coarse risk bucket reported alongside the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=2499 => RiskLevel::Low,
            2500..=4999 => RiskLevel::Medium,
            5000..=7499 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// One oracle answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0-10000, higher is riskier
    pub risk_score: u32,
    pub level: RiskLevel,
    /// Whether the oracle approves the strategy at all
    pub approved: bool,
    pub updated_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn new(risk_score: u32, updated_at: DateTime<Utc>) -> Self {
        Self {
            risk_score,
            level: RiskLevel::from_score(risk_score),
            approved: true,
            updated_at,
        }
    }
}

/// External risk scoring service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiskOracle: Send + Sync {
    async fn assess_strategy_risk(&self, id: &StrategyId) -> anyhow::Result<RiskAssessment>;
}

/// Risk score the vault will act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskReading {
    Fresh(u32),
    /// Failed, stale or unapproved; acted on as maximum risk
    Degraded { reason: String },
}

impl RiskReading {
    /// Interpret an oracle call outcome at `now`.
    pub fn from_outcome(
        outcome: CallOutcome<RiskAssessment>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Self {
        match outcome {
            CallOutcome::Ok(assessment) => {
                if now - assessment.updated_at > staleness {
                    RiskReading::Degraded {
                        reason: format!("assessment from {} is stale", assessment.updated_at),
                    }
                } else if !assessment.approved {
                    RiskReading::Degraded {
                        reason: "strategy not approved".to_string(),
                    }
                } else if assessment.risk_score > MAX_RISK_SCORE {
                    RiskReading::Degraded {
                        reason: format!("out-of-range score {}", assessment.risk_score),
                    }
                } else {
                    RiskReading::Fresh(assessment.risk_score)
                }
            }
            other => RiskReading::Degraded {
                reason: other.to_string(),
            },
        }
    }

    /// Score to record in the registry.
    pub fn effective_score(&self) -> u32 {
        match self {
            RiskReading::Fresh(score) => *score,
            RiskReading::Degraded { .. } => MAX_RISK_SCORE,
        }
    }
}

/// Oracle serving operator-set scores. Used for simulation and tests.
#[derive(Debug, Default)]
pub struct StaticRiskOracle {
    assessments: RwLock<HashMap<StrategyId, RiskAssessment>>,
}

impl StaticRiskOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh score for `id`.
    pub fn set_score(&self, id: &StrategyId, score: u32) {
        self.set_assessment(id, RiskAssessment::new(score, Utc::now()));
    }

    pub fn set_assessment(&self, id: &StrategyId, assessment: RiskAssessment) {
        if let Ok(mut map) = self.assessments.write() {
            map.insert(id.clone(), assessment);
        }
    }
}

#[async_trait]
impl RiskOracle for StaticRiskOracle {
    async fn assess_strategy_risk(&self, id: &StrategyId) -> anyhow::Result<RiskAssessment> {
        let map = self
            .assessments
            .read()
            .map_err(|_| anyhow::anyhow!("oracle state poisoned"))?;
        map.get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no assessment for {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_assessment_used() {
        let now = Utc::now();
        let reading = RiskReading::from_outcome(
            CallOutcome::Ok(RiskAssessment::new(3200, now - Duration::minutes(5))),
            now,
            Duration::hours(1),
        );
        assert_eq!(reading, RiskReading::Fresh(3200));
        assert_eq!(reading.effective_score(), 3200);
    }

    #[test]
    fn test_stale_assessment_is_max_risk() {
        let now = Utc::now();
        let reading = RiskReading::from_outcome(
            CallOutcome::Ok(RiskAssessment::new(1000, now - Duration::hours(2))),
            now,
            Duration::hours(1),
        );
        assert!(matches!(reading, RiskReading::Degraded { .. }));
        assert_eq!(reading.effective_score(), MAX_RISK_SCORE);
    }

    #[test]
    fn test_unapproved_and_failed_are_max_risk() {
        let now = Utc::now();
        let mut unapproved = RiskAssessment::new(1000, now);
        unapproved.approved = false;
        let reading = RiskReading::from_outcome(CallOutcome::Ok(unapproved), now, Duration::hours(1));
        assert_eq!(reading.effective_score(), MAX_RISK_SCORE);

        let reading = RiskReading::from_outcome(
            CallOutcome::Impaired("no response".into()),
            now,
            Duration::hours(1),
        );
        assert_eq!(reading.effective_score(), MAX_RISK_SCORE);
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(4999), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(5000), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(10_000), RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_mock_oracle_error_is_degraded() {
        let mut oracle = MockRiskOracle::new();
        oracle
            .expect_assess_strategy_risk()
            .returning(|_| Err(anyhow::anyhow!("feed offline")));

        let outcome = crate::backend::guarded(
            std::time::Duration::from_millis(50),
            oracle.assess_strategy_risk(&StrategyId::new("aave")),
        )
        .await;
        let reading = RiskReading::from_outcome(outcome, Utc::now(), Duration::hours(1));
        assert_eq!(
            reading,
            RiskReading::Degraded {
                reason: "failed: feed offline".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_static_oracle_serves_scores() {
        let oracle = StaticRiskOracle::new();
        let id = StrategyId::new("aave");
        oracle.set_score(&id, 2100);

        let assessment = oracle.assess_strategy_risk(&id).await.unwrap();
        assert_eq!(assessment.risk_score, 2100);
        assert!(oracle
            .assess_strategy_risk(&StrategyId::new("missing"))
            .await
            .is_err());
    }
}
