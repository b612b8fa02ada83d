//! Risk-adjusted proportional capital allocation.

use crate::config::AllocationConfig;
use crate::strategy::{StrategyId, StrategyRecord, StrategyRegistry};
use crate::utils::decimal::{floor_to_scale, mul_div_floor, weighted_average};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::debug;

/// Target amount for a single strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAllocation {
    pub strategy_id: StrategyId,
    pub amount: Decimal,
    /// Strategy yield at planning time
    pub expected_yield: Decimal,
}

/// Output of one optimizer call, ordered by strategy id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationPlan {
    pub entries: Vec<PlannedAllocation>,
    /// Allocation-weighted yield of the contributing strategies
    pub expected_yield: Decimal,
    /// Capital that found no capacity and stays idle
    pub unplaced: Decimal,
    pub total_amount: Decimal,
}

impl AllocationPlan {
    fn empty(total_amount: Decimal) -> Self {
        Self {
            entries: Vec::new(),
            expected_yield: Decimal::ZERO,
            unplaced: total_amount.max(Decimal::ZERO),
            total_amount,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total capital placed by the plan.
    pub fn placed(&self) -> Decimal {
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Planned amount for `id` (zero when absent).
    pub fn target_for(&self, id: &StrategyId) -> Decimal {
        self.entries
            .iter()
            .find(|e| &e.strategy_id == id)
            .map(|e| e.amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// A strategy entering the proportional split.
#[derive(Debug, Clone)]
struct Candidate {
    id: StrategyId,
    score: Decimal,
    current_yield: Decimal,
    cap: Decimal,
}

/// Computes allocation plans from registry state.
///
/// Every method is a pure function of its inputs and the registry it is
/// handed: re-running it within one rebalance cycle yields the same plan.
#[derive(Debug, Clone)]
pub struct AllocationOptimizer {
    config: AllocationConfig,
    amount_scale: u32,
}

impl AllocationOptimizer {
    /// Create a new optimizer.
    pub fn new(config: AllocationConfig, amount_scale: u32) -> Self {
        Self {
            config,
            amount_scale,
        }
    }

    /// Plan target holdings for `total_amount` of deployable capital.
    ///
    /// Each strategy is capped at `min(capacity, global cap)`.
    pub fn calculate_optimal_allocation(
        &self,
        registry: &StrategyRegistry,
        total_amount: Decimal,
        risk_ceiling: u32,
    ) -> AllocationPlan {
        let candidates = registry
            .get_eligible(total_amount, risk_ceiling)
            .into_iter()
            .map(|r| self.candidate(r, registry.effective_cap(r)))
            .collect();
        self.allocate(candidates, total_amount)
    }

    /// Plan where to place `amount` of new capital on top of the current
    /// allocations, using only each strategy's remaining headroom.
    pub fn calculate_incremental_allocation(
        &self,
        registry: &StrategyRegistry,
        amount: Decimal,
        risk_ceiling: u32,
    ) -> AllocationPlan {
        let candidates = registry
            .get_eligible(amount, risk_ceiling)
            .into_iter()
            .map(|r| self.candidate(r, registry.headroom(r)))
            .collect();
        self.allocate(candidates, amount)
    }

    /// Allocation-weighted yield of the current deployment.
    pub fn current_weighted_yield(registry: &StrategyRegistry) -> Decimal {
        let weights: Vec<(Decimal, Decimal)> = registry
            .records()
            .filter(|r| r.allocation > Decimal::ZERO)
            .map(|r| (r.current_yield, r.allocation))
            .collect();
        weighted_average(&weights)
    }

    /// Risk-adjusted score: `yield * 10000 / (risk + 1000)`, boosted for deep markets.
    pub fn score(&self, record: &StrategyRecord) -> Decimal {
        let base = record.current_yield * dec!(10000) / Decimal::from(record.risk_score + 1000);
        if record.liquidity_depth > self.config.large_liquidity_threshold {
            base * self.config.liquidity_bonus
        } else {
            base
        }
    }

    fn candidate(&self, record: &StrategyRecord, cap: Decimal) -> Candidate {
        Candidate {
            id: record.id.clone(),
            score: self.score(record),
            current_yield: record.current_yield,
            cap,
        }
    }

    fn allocate(&self, candidates: Vec<Candidate>, total_amount: Decimal) -> AllocationPlan {
        let total_amount = floor_to_scale(total_amount, self.amount_scale);
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.score > Decimal::ZERO && c.cap > Decimal::ZERO)
            .collect();

        if total_amount <= Decimal::ZERO || candidates.is_empty() {
            return AllocationPlan::empty(total_amount);
        }

        let score_sum: Decimal = candidates.iter().map(|c| c.score).sum();

        // Proportional split; the last strategy absorbs the rounding remainder
        let mut amounts = Vec::with_capacity(candidates.len());
        let mut assigned = Decimal::ZERO;
        for (idx, candidate) in candidates.iter().enumerate() {
            let amount = if idx + 1 == candidates.len() {
                total_amount - assigned
            } else {
                self.proportional(total_amount, candidate.score, score_sum)
            };
            assigned += amount;
            amounts.push(amount);
        }

        // Clip to caps and collect the excess
        let mut excess = Decimal::ZERO;
        for (amount, candidate) in amounts.iter_mut().zip(&candidates) {
            if *amount > candidate.cap {
                excess += *amount - candidate.cap;
                *amount = candidate.cap;
            }
        }

        // Push excess to the highest-scoring strategies with spare capacity
        if excess > Decimal::ZERO {
            let mut by_score: Vec<usize> = (0..candidates.len()).collect();
            by_score.sort_by(|&a, &b| {
                candidates[b]
                    .score
                    .cmp(&candidates[a].score)
                    .then_with(|| candidates[a].id.cmp(&candidates[b].id))
            });

            for idx in by_score {
                if excess == Decimal::ZERO {
                    break;
                }
                let spare = candidates[idx].cap - amounts[idx];
                if spare <= Decimal::ZERO {
                    continue;
                }
                let take = spare.min(excess);
                amounts[idx] += take;
                excess -= take;
            }
        }

        let entries: Vec<PlannedAllocation> = candidates
            .iter()
            .zip(amounts)
            .filter(|(_, amount)| *amount > Decimal::ZERO)
            .map(|(candidate, amount)| PlannedAllocation {
                strategy_id: candidate.id.clone(),
                amount,
                expected_yield: candidate.current_yield,
            })
            .collect();

        let weights: Vec<(Decimal, Decimal)> = entries
            .iter()
            .map(|e| (e.expected_yield, e.amount))
            .collect();
        let expected_yield = weighted_average(&weights);

        debug!(
            %total_amount,
            strategies = entries.len(),
            %expected_yield,
            unplaced = %excess,
            "Allocation plan computed"
        );

        AllocationPlan {
            entries,
            expected_yield,
            unplaced: excess,
            total_amount,
        }
    }

    fn proportional(&self, total: Decimal, score: Decimal, score_sum: Decimal) -> Decimal {
        mul_div_floor(total, score, score_sum, self.amount_scale)
            .unwrap_or_else(|| floor_to_scale(total * (score / score_sum), self.amount_scale))
    }
}
