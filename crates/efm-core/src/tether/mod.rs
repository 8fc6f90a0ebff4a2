//! Dynamic tether management.
//!
//! A tether is a per-capsule bound on a behavior (exploration, spawning,
//! resource draw, learning, risk). The tether manager maps the discrete
//! stress level to a tether vector and republishes it to every registered
//! capsule. Publication is atomic per capsule: a reader always observes one
//! coherent vector, never a mix of two levels.
//!
//! The level table is configuration; validation guarantees that a higher
//! stress level never has more slack than a lower one, which makes tether
//! updates monotone with respect to stress direction.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::CapsuleRegistry;
use crate::stress::StressLevel;

/// Behavioral bounds applied to a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TetherVector {
    /// How far from established precedent the capsule may explore, `[0, 1]`.
    pub exploration_radius: f64,

    /// Children the capsule may spawn in the current window.
    pub spawn_budget: u32,

    /// Fraction of the nominal resource rate available, `[0, 1]`.
    pub resource_rate: f64,

    /// Learning rate multiplier, `[0, 1]`.
    pub learning_rate: f64,

    /// Tolerated risk score for admitted actions, `[0, 1]`.
    pub risk_tolerance: f64,
}

impl TetherVector {
    /// Clamps every fractional component to `[0, 1]`.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            exploration_radius: self.exploration_radius.clamp(0.0, 1.0),
            spawn_budget: self.spawn_budget,
            resource_rate: self.resource_rate.clamp(0.0, 1.0),
            learning_rate: self.learning_rate.clamp(0.0, 1.0),
            risk_tolerance: self.risk_tolerance.clamp(0.0, 1.0),
        }
    }

    /// Returns true if no component of `self` has more slack than `other`.
    #[must_use]
    pub fn no_slacker_than(&self, other: &Self) -> bool {
        self.exploration_radius <= other.exploration_radius
            && self.spawn_budget <= other.spawn_budget
            && self.resource_rate <= other.resource_rate
            && self.learning_rate <= other.learning_rate
            && self.risk_tolerance <= other.risk_tolerance
    }
}

/// Per-stress-level tether table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TetherTable {
    /// Bounds at low stress.
    pub low: TetherVector,
    /// Bounds at medium stress.
    pub medium: TetherVector,
    /// Bounds at high stress.
    pub high: TetherVector,
    /// Bounds at critical stress.
    pub critical: TetherVector,
}

impl TetherTable {
    /// The vector for a discrete stress level.
    #[must_use]
    pub const fn for_level(&self, level: StressLevel) -> TetherVector {
        match level {
            StressLevel::Low => self.low,
            StressLevel::Medium => self.medium,
            StressLevel::High => self.high,
            StressLevel::Critical => self.critical,
        }
    }

    /// Verifies that rising stress never adds slack.
    #[must_use]
    pub fn is_monotone(&self) -> bool {
        self.medium.no_slacker_than(&self.low)
            && self.high.no_slacker_than(&self.medium)
            && self.critical.no_slacker_than(&self.high)
    }
}

impl Default for TetherTable {
    fn default() -> Self {
        Self {
            low: TetherVector {
                exploration_radius: 1.0,
                spawn_budget: 4,
                resource_rate: 1.0,
                learning_rate: 1.0,
                risk_tolerance: 0.6,
            },
            medium: TetherVector {
                exploration_radius: 0.7,
                spawn_budget: 2,
                resource_rate: 0.8,
                learning_rate: 0.7,
                risk_tolerance: 0.4,
            },
            high: TetherVector {
                exploration_radius: 0.4,
                spawn_budget: 1,
                resource_rate: 0.5,
                learning_rate: 0.4,
                risk_tolerance: 0.2,
            },
            critical: TetherVector {
                exploration_radius: 0.2,
                spawn_budget: 0,
                resource_rate: 0.3,
                learning_rate: 0.1,
                risk_tolerance: 0.05,
            },
        }
    }
}

/// Maps stress levels to published per-capsule tether vectors.
#[derive(Debug)]
pub struct TetherManager {
    table: TetherTable,
}

impl TetherManager {
    /// Creates a manager over a level table.
    #[must_use]
    pub const fn new(table: TetherTable) -> Self {
        Self { table }
    }

    /// The vector the table assigns to a level.
    #[must_use]
    pub fn vector_for(&self, level: StressLevel) -> TetherVector {
        self.table.for_level(level).clamped()
    }

    /// Republishes tether vectors for every registered capsule at the
    /// given stress level.
    ///
    /// Returns the number of capsules updated. Each capsule's vector is
    /// swapped in one atomic publication; the response contract (all
    /// capsules reflect a level change within 10 ticks) is met by calling
    /// this from the stress reaction path, which runs every tick.
    pub fn apply(&self, level: StressLevel, registry: &CapsuleRegistry) -> usize {
        let vector = self.vector_for(level);
        let updated = registry.publish_tethers(vector);
        debug!(%level, updated, "tether vectors republished");
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_monotone() {
        assert!(TetherTable::default().is_monotone());
    }

    #[test]
    fn critical_exploration_radius_is_tight() {
        let manager = TetherManager::new(TetherTable::default());
        let critical = manager.vector_for(StressLevel::Critical);
        assert!(critical.exploration_radius <= 0.2);
        assert_eq!(critical.spawn_budget, 0);
    }

    #[test]
    fn non_monotone_table_is_detected() {
        let mut table = TetherTable::default();
        table.critical.exploration_radius = 0.9;
        assert!(!table.is_monotone());
    }

    #[test]
    fn clamping_bounds_components() {
        let vector = TetherVector {
            exploration_radius: 1.5,
            spawn_budget: 3,
            resource_rate: -0.2,
            learning_rate: 0.5,
            risk_tolerance: 2.0,
        }
        .clamped();
        assert!((vector.exploration_radius - 1.0).abs() < f64::EPSILON);
        assert!((vector.resource_rate - 0.0).abs() < f64::EPSILON);
        assert!((vector.risk_tolerance - 1.0).abs() < f64::EPSILON);
    }
}
