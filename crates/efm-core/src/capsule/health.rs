//! Capsule health vector and the composite formula.

use serde::{Deserialize, Serialize};

/// Weight of the general quality component.
const W_Q_GEN: f64 = 0.40;

/// Weight of the synthesis quality component.
const W_Q_SYNTH: f64 = 0.35;

/// Weight of the temporal stability component.
const W_Q_TEMP: f64 = 0.25;

/// Weight (negative) of the entropy component.
const W_ENTROPY: f64 = 0.20;

/// Computes the composite health score.
///
/// `0.40 * q_gen + 0.35 * q_synth + 0.25 * q_temp - 0.20 * entropy`,
/// clamped to `[0, 1]`.
#[must_use]
pub fn composite_health(q_gen: f64, q_synth: f64, q_temp: f64, entropy: f64) -> f64 {
    (W_Q_GEN * q_gen + W_Q_SYNTH * q_synth + W_Q_TEMP * q_temp - W_ENTROPY * entropy)
        .clamp(0.0, 1.0)
}

/// Health assessment for a capsule.
///
/// All components are in `[0, 1]`. The composite is always computed from
/// the components; it is never stored independently, so the formula
/// invariant holds at every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthVector {
    /// General quality.
    pub q_gen: f64,

    /// Synthesis quality.
    pub q_synth: f64,

    /// Temporal stability.
    pub q_temp: f64,

    /// Observed entropy.
    pub entropy: f64,
}

impl HealthVector {
    /// A fully healthy vector.
    pub const PERFECT: Self = Self {
        q_gen: 1.0,
        q_synth: 1.0,
        q_temp: 1.0,
        entropy: 0.0,
    };

    /// Creates a health vector, clamping each component to `[0, 1]`.
    #[must_use]
    pub fn new(q_gen: f64, q_synth: f64, q_temp: f64, entropy: f64) -> Self {
        Self {
            q_gen: q_gen.clamp(0.0, 1.0),
            q_synth: q_synth.clamp(0.0, 1.0),
            q_temp: q_temp.clamp(0.0, 1.0),
            entropy: entropy.clamp(0.0, 1.0),
        }
    }

    /// The composite health score in `[0, 1]`.
    #[must_use]
    pub fn composite(&self) -> f64 {
        composite_health(self.q_gen, self.q_synth, self.q_temp, self.entropy)
    }
}

impl Default for HealthVector {
    fn default() -> Self {
        Self::PERFECT
    }
}
