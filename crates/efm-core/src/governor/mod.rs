//! Resource governor.
//!
//! Allocates CPU, memory, execution, and IO budgets per capsule from its
//! priority tier, scaled by the current stress level and the capsule's
//! health. Four named circuit breakers (spawn, lineage, `sci_broadcast`,
//! allocation) trip when stress exceeds their configured thresholds and
//! reset only after stress falls one discrete level below the trip point.

mod breakers;

pub use breakers::{BreakerKind, BreakerThresholds, CircuitBreakers};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stress::StressLevel;

/// Health divisor of the budget multiplier.
const HEALTH_PIVOT: f64 = 0.65;

/// Ceiling of the health multiplier.
const HEALTH_MULTIPLIER_CAP: f64 = 1.25;

/// Errors from governor admission.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// A circuit breaker is open.
    #[error("circuit open: {breaker}")]
    CircuitOpen {
        /// The open breaker.
        breaker: BreakerKind,
    },

    /// The requested allocation exceeds the derived budget.
    #[error("budget exceeded: requested {requested} of {available} {resource}")]
    BudgetExceeded {
        /// Resource name.
        resource: &'static str,
        /// Requested amount.
        requested: u64,
        /// Available amount.
        available: u64,
    },
}

/// Absolute priority tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    /// Reserved for the override channel and invariant enforcement.
    Absolute,
    /// Safety-critical capsule work.
    Critical,
    /// Deadline-bound work.
    Urgent,
    /// Ordinary work.
    Normal,
    /// Opportunistic work, first to starve.
    Deferred,
}

/// Per-capsule resource budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// CPU share in `[0, 1]`.
    pub cpu_share: f64,

    /// Memory ceiling in bytes.
    pub memory_ceiling_bytes: u64,

    /// Execution ticks before re-evaluation.
    pub execution_ticks: u64,

    /// IO bandwidth fraction in `[0, 1]`.
    pub io_fraction: f64,

    /// Children the capsule may spawn before re-evaluation.
    pub spawn_budget: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpu_share: 0.1,
            memory_ceiling_bytes: 64 * 1024 * 1024,
            execution_ticks: 100,
            io_fraction: 0.1,
            spawn_budget: 1,
        }
    }
}

/// Baseline amounts from which tier budgets are derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetBaseline {
    /// Total CPU share distributed across a tier.
    pub cpu_share: f64,

    /// Memory ceiling at ratio 1.0.
    pub memory_ceiling_bytes: u64,

    /// Execution ticks at ratio 1.0.
    pub execution_ticks: u64,

    /// IO fraction at ratio 1.0.
    pub io_fraction: f64,

    /// Spawn budget at ratio 1.0.
    pub spawn_budget: u32,
}

impl Default for BudgetBaseline {
    fn default() -> Self {
        Self {
            cpu_share: 1.0,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            execution_ticks: 1_000,
            io_fraction: 1.0,
            spawn_budget: 4,
        }
    }
}

/// Stress-dependent allocation ratios per tier.
///
/// Rows are stress levels, columns are tiers in declaration order
/// (absolute, critical, urgent, normal, deferred).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationTable {
    /// Ratios at low stress.
    pub low: [f64; 5],
    /// Ratios at medium stress.
    pub medium: [f64; 5],
    /// Ratios at high stress.
    pub high: [f64; 5],
    /// Ratios at critical stress.
    pub critical: [f64; 5],
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self {
            low: [1.0, 0.9, 0.8, 0.6, 0.4],
            medium: [1.0, 0.8, 0.6, 0.4, 0.2],
            high: [1.0, 0.7, 0.4, 0.2, 0.05],
            critical: [1.0, 0.5, 0.2, 0.05, 0.0],
        }
    }
}

impl AllocationTable {
    /// The ratio for a tier at a stress level.
    #[must_use]
    pub const fn ratio(&self, level: StressLevel, tier: PriorityTier) -> f64 {
        let row = match level {
            StressLevel::Low => &self.low,
            StressLevel::Medium => &self.medium,
            StressLevel::High => &self.high,
            StressLevel::Critical => &self.critical,
        };
        row[tier_index(tier)]
    }
}

const fn tier_index(tier: PriorityTier) -> usize {
    match tier {
        PriorityTier::Absolute => 0,
        PriorityTier::Critical => 1,
        PriorityTier::Urgent => 2,
        PriorityTier::Normal => 3,
        PriorityTier::Deferred => 4,
    }
}

/// The health multiplier: `health / 0.65`, capped at 1.25.
#[must_use]
pub fn health_multiplier(health_composite: f64) -> f64 {
    (health_composite.clamp(0.0, 1.0) / HEALTH_PIVOT).min(HEALTH_MULTIPLIER_CAP)
}

/// Derives budgets and guards admission behind the circuit breakers.
#[derive(Debug)]
pub struct ResourceGovernor {
    baseline: BudgetBaseline,
    table: AllocationTable,
    breakers: CircuitBreakers,
}

impl ResourceGovernor {
    /// Creates a governor.
    #[must_use]
    pub fn new(
        baseline: BudgetBaseline,
        table: AllocationTable,
        thresholds: BreakerThresholds,
    ) -> Self {
        Self {
            baseline,
            table,
            breakers: CircuitBreakers::new(thresholds),
        }
    }

    /// The breaker bank.
    #[must_use]
    pub const fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Derives a capsule's budget from tier, stress level, and health.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn derive_budget(
        &self,
        tier: PriorityTier,
        level: StressLevel,
        health_composite: f64,
    ) -> ResourceBudget {
        let ratio = self.table.ratio(level, tier);
        let scale = ratio * health_multiplier(health_composite);

        ResourceBudget {
            cpu_share: (self.baseline.cpu_share * scale).clamp(0.0, 1.0),
            memory_ceiling_bytes: (self.baseline.memory_ceiling_bytes as f64 * scale) as u64,
            execution_ticks: ((self.baseline.execution_ticks as f64 * scale) as u64).max(1),
            io_fraction: (self.baseline.io_fraction * scale).clamp(0.0, 1.0),
            spawn_budget: (f64::from(self.baseline.spawn_budget) * scale).floor() as u32,
        }
    }

    /// Admits a spawn, or rejects if the spawn breaker is open or the
    /// derived spawn budget is zero.
    ///
    /// # Errors
    ///
    /// - [`GovernorError::CircuitOpen`] if the spawn breaker is open.
    /// - [`GovernorError::BudgetExceeded`] if the spawn budget is exhausted.
    pub fn admit_spawn(
        &self,
        tier: PriorityTier,
        level: StressLevel,
        parent_health: f64,
    ) -> Result<(), GovernorError> {
        self.breakers.check(BreakerKind::Spawn)?;
        let budget = self.derive_budget(tier, level, parent_health);
        if budget.spawn_budget == 0 {
            return Err(GovernorError::BudgetExceeded {
                resource: "spawn",
                requested: 1,
                available: 0,
            });
        }
        Ok(())
    }

    /// Admits a general allocation request.
    ///
    /// # Errors
    ///
    /// - [`GovernorError::CircuitOpen`] if the allocation breaker is open.
    /// - [`GovernorError::BudgetExceeded`] if the request exceeds the
    ///   derived memory ceiling.
    pub fn admit_allocation(
        &self,
        tier: PriorityTier,
        level: StressLevel,
        health_composite: f64,
        requested_bytes: u64,
    ) -> Result<ResourceBudget, GovernorError> {
        self.breakers.check(BreakerKind::Allocation)?;
        let budget = self.derive_budget(tier, level, health_composite);
        if requested_bytes > budget.memory_ceiling_bytes {
            return Err(GovernorError::BudgetExceeded {
                resource: "memory_bytes",
                requested: requested_bytes,
                available: budget.memory_ceiling_bytes,
            });
        }
        Ok(budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> ResourceGovernor {
        ResourceGovernor::new(
            BudgetBaseline::default(),
            AllocationTable::default(),
            BreakerThresholds::default(),
        )
    }

    #[test]
    fn health_multiplier_is_capped() {
        assert!((health_multiplier(0.65) - 1.0).abs() < 1e-12);
        assert!((health_multiplier(1.0) - 1.25).abs() < 1e-12);
        assert!(health_multiplier(0.325) < 0.51);
    }

    #[test]
    fn higher_stress_means_smaller_budget() {
        let g = governor();
        let low = g.derive_budget(PriorityTier::Normal, StressLevel::Low, 0.65);
        let critical = g.derive_budget(PriorityTier::Normal, StressLevel::Critical, 0.65);

        assert!(critical.cpu_share < low.cpu_share);
        assert!(critical.memory_ceiling_bytes < low.memory_ceiling_bytes);
        assert!(critical.spawn_budget < low.spawn_budget);
    }

    #[test]
    fn absolute_tier_keeps_full_ratio_under_critical_stress() {
        let g = governor();
        let budget = g.derive_budget(PriorityTier::Absolute, StressLevel::Critical, 0.65);
        assert!((budget.cpu_share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spawn_denied_at_critical_stress() {
        let g = governor();
        let result = g.admit_spawn(PriorityTier::Normal, StressLevel::Critical, 0.9);
        assert!(matches!(
            result,
            Err(GovernorError::BudgetExceeded { resource: "spawn", .. })
        ));
    }

    #[test]
    fn allocation_checks_memory_ceiling() {
        let g = governor();
        let ok = g.admit_allocation(PriorityTier::Normal, StressLevel::Low, 0.9, 1024);
        assert!(ok.is_ok());

        let too_big = g.admit_allocation(PriorityTier::Deferred, StressLevel::High, 0.5, u64::MAX);
        assert!(matches!(too_big, Err(GovernorError::BudgetExceeded { .. })));
    }

    #[test]
    fn execution_ticks_never_reach_zero() {
        let g = governor();
        let budget = g.derive_budget(PriorityTier::Deferred, StressLevel::High, 0.1);
        assert!(budget.execution_ticks >= 1);
    }
}
