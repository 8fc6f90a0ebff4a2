//! Swarm stress monitor.
//!
//! Stress is a scalar in `[0, 1]` aggregating the health deficit, observed
//! entropy, resource pressure, and coherence deficit:
//!
//! ```text
//! stress = 0.35 * (1 - health) + 0.25 * entropy
//!        + 0.20 * resource_pressure + 0.20 * (1 - sci)
//! ```
//!
//! clamped to `[0, 1]` and discretized to Low / Medium / High / Critical.
//! The monitor publishes samples through a watch channel; the tether
//! manager and resource governor react to level changes.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::Tick;

/// Discrete stress level.
///
/// The numeric thresholds are canonical; the names are display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StressLevel {
    /// Stress below the low threshold.
    Low,
    /// Stress below the medium threshold.
    Medium,
    /// Stress below the high threshold.
    High,
    /// Stress at or above the high threshold.
    Critical,
}

impl StressLevel {
    /// Returns the level one step below, saturating at Low.
    #[must_use]
    pub const fn one_below(self) -> Self {
        match self {
            Self::Low | Self::Medium => Self::Low,
            Self::High => Self::Medium,
            Self::Critical => Self::High,
        }
    }
}

impl std::fmt::Display for StressLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Weights of the canonical stress formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressWeights {
    /// Weight of the health deficit component.
    #[serde(default = "default_w_health")]
    pub health: f64,

    /// Weight of the entropy component.
    #[serde(default = "default_w_entropy")]
    pub entropy: f64,

    /// Weight of the resource pressure component.
    #[serde(default = "default_w_resources")]
    pub resources: f64,

    /// Weight of the coherence deficit component.
    #[serde(default = "default_w_sci")]
    pub sci: f64,
}

const fn default_w_health() -> f64 {
    0.35
}

const fn default_w_entropy() -> f64 {
    0.25
}

const fn default_w_resources() -> f64 {
    0.20
}

const fn default_w_sci() -> f64 {
    0.20
}

impl Default for StressWeights {
    fn default() -> Self {
        Self {
            health: default_w_health(),
            entropy: default_w_entropy(),
            resources: default_w_resources(),
            sci: default_w_sci(),
        }
    }
}

/// Discretization thresholds (upper bounds of Low, Medium, High).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressThresholds {
    /// Upper bound of the Low band.
    #[serde(default = "default_t_low")]
    pub low: f64,

    /// Upper bound of the Medium band.
    #[serde(default = "default_t_medium")]
    pub medium: f64,

    /// Upper bound of the High band; Critical begins here.
    #[serde(default = "default_t_high")]
    pub high: f64,
}

const fn default_t_low() -> f64 {
    0.25
}

const fn default_t_medium() -> f64 {
    0.50
}

const fn default_t_high() -> f64 {
    0.75
}

impl Default for StressThresholds {
    fn default() -> Self {
        Self {
            low: default_t_low(),
            medium: default_t_medium(),
            high: default_t_high(),
        }
    }
}

impl StressThresholds {
    /// Discretizes a stress value.
    #[must_use]
    pub fn level_of(&self, value: f64) -> StressLevel {
        if value < self.low {
            StressLevel::Low
        } else if value < self.medium {
            StressLevel::Medium
        } else if value < self.high {
            StressLevel::High
        } else {
            StressLevel::Critical
        }
    }
}

/// Aggregate inputs to the stress formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressInputs {
    /// Mean composite health across active capsules.
    pub health_composite: f64,

    /// Mean observed entropy across active capsules.
    pub entropy: f64,

    /// Resource usage normalized so 0 is idle and 1 is exhausted.
    pub resource_pressure: f64,

    /// Current swarm coherence index.
    pub sci: f64,
}

impl Default for StressInputs {
    fn default() -> Self {
        Self {
            health_composite: 1.0,
            entropy: 0.0,
            resource_pressure: 0.0,
            sci: 1.0,
        }
    }
}

/// A published stress sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressSample {
    /// Canonical stress value in `[0, 1]`.
    pub value: f64,

    /// Discretized level.
    pub level: StressLevel,

    /// Tick at which the sample was computed.
    pub tick: Tick,
}

impl StressSample {
    /// A quiescent sample at tick 0.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            value: 0.0,
            level: StressLevel::Low,
            tick: Tick::ZERO,
        }
    }
}

/// Fraction of incident pressure retained per recompute.
const INCIDENT_DECAY: f64 = 0.5;

struct MonitorState {
    inputs: StressInputs,
    incident_pressure: f64,
}

/// Continuous stress aggregator.
pub struct StressMonitor {
    weights: StressWeights,
    thresholds: StressThresholds,
    state: Mutex<MonitorState>,
    publisher: watch::Sender<StressSample>,
}

impl StressMonitor {
    /// Creates a monitor with the given formula configuration.
    #[must_use]
    pub fn new(weights: StressWeights, thresholds: StressThresholds) -> Self {
        let (publisher, _) = watch::channel(StressSample::initial());
        Self {
            weights,
            thresholds,
            state: Mutex::new(MonitorState {
                inputs: StressInputs::default(),
                incident_pressure: 0.0,
            }),
            publisher,
        }
    }

    /// Subscribes to published samples.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StressSample> {
        self.publisher.subscribe()
    }

    /// The most recently published sample.
    #[must_use]
    pub fn current(&self) -> StressSample {
        *self.publisher.borrow()
    }

    /// Replaces the formula inputs.
    pub fn set_inputs(&self, inputs: StressInputs) {
        self.state.lock().unwrap().inputs = inputs;
    }

    /// Adds transient incident pressure (audit overload, escape attempts).
    ///
    /// Incident pressure joins the resource component and decays across
    /// recomputations.
    pub fn inject_incident(&self, pressure: f64) {
        let mut state = self.state.lock().unwrap();
        state.incident_pressure = (state.incident_pressure + pressure).clamp(0.0, 1.0);
    }

    /// Computes the canonical stress value for a set of inputs.
    #[must_use]
    pub fn stress_of(&self, inputs: &StressInputs, incident_pressure: f64) -> f64 {
        let resource = (inputs.resource_pressure + incident_pressure).clamp(0.0, 1.0);
        let raw = self.weights.health * (1.0 - inputs.health_composite.clamp(0.0, 1.0))
            + self.weights.entropy * inputs.entropy.clamp(0.0, 1.0)
            + self.weights.resources * resource
            + self.weights.sci * (1.0 - inputs.sci.clamp(0.0, 1.0));
        raw.clamp(0.0, 1.0)
    }

    /// Recomputes stress and publishes the sample.
    ///
    /// Returns the sample together with the previous discrete level so the
    /// caller can log level transitions.
    pub fn recompute(&self, tick: Tick) -> (StressSample, StressLevel) {
        let (value, level) = {
            let mut state = self.state.lock().unwrap();
            let value = self.stress_of(&state.inputs, state.incident_pressure);
            state.incident_pressure *= INCIDENT_DECAY;
            (value, self.thresholds.level_of(value))
        };

        let previous = self.publisher.borrow().level;
        let sample = StressSample { value, level, tick };
        self.publisher.send_replace(sample);

        if level != previous {
            debug!(%tick, value, from = %previous, to = %level, "stress level changed");
        }
        (sample, previous)
    }

    /// The configured thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> &StressThresholds {
        &self.thresholds
    }
}

impl std::fmt::Debug for StressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressMonitor")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> StressMonitor {
        StressMonitor::new(StressWeights::default(), StressThresholds::default())
    }

    #[test]
    fn quiescent_inputs_give_zero_stress() {
        let m = monitor();
        let (sample, _) = m.recompute(Tick::new(1));
        assert!(sample.value.abs() < f64::EPSILON);
        assert_eq!(sample.level, StressLevel::Low);
    }

    #[test]
    fn formula_matches_spec_weights() {
        let m = monitor();
        let inputs = StressInputs {
            health_composite: 0.5,
            entropy: 0.4,
            resource_pressure: 0.6,
            sci: 0.8,
        };
        let expected = 0.35 * 0.5 + 0.25 * 0.4 + 0.20 * 0.6 + 0.20 * 0.2;
        assert!((m.stress_of(&inputs, 0.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn full_resource_pressure_is_critical() {
        let m = monitor();
        m.set_inputs(StressInputs {
            health_composite: 0.2,
            entropy: 0.9,
            resource_pressure: 1.0,
            sci: 0.1,
        });
        let (sample, previous) = m.recompute(Tick::new(5));
        assert_eq!(previous, StressLevel::Low);
        assert_eq!(sample.level, StressLevel::Critical);
        assert!(sample.value >= 0.75);
    }

    #[test]
    fn discretization_boundaries() {
        let t = StressThresholds::default();
        assert_eq!(t.level_of(0.0), StressLevel::Low);
        assert_eq!(t.level_of(0.24), StressLevel::Low);
        assert_eq!(t.level_of(0.25), StressLevel::Medium);
        assert_eq!(t.level_of(0.49), StressLevel::Medium);
        assert_eq!(t.level_of(0.50), StressLevel::High);
        assert_eq!(t.level_of(0.75), StressLevel::Critical);
        assert_eq!(t.level_of(1.0), StressLevel::Critical);
    }

    #[test]
    fn incident_pressure_raises_stress_then_decays() {
        let m = monitor();
        m.inject_incident(1.0);

        let (spiked, _) = m.recompute(Tick::new(1));
        assert!(spiked.value >= 0.20 - 1e-12);

        let (decayed, _) = m.recompute(Tick::new(2));
        assert!(decayed.value < spiked.value);
    }

    #[test]
    fn watch_subscribers_observe_samples() {
        let m = monitor();
        let rx = m.subscribe();
        m.set_inputs(StressInputs {
            health_composite: 0.0,
            entropy: 1.0,
            resource_pressure: 1.0,
            sci: 0.0,
        });
        m.recompute(Tick::new(3));
        assert_eq!(rx.borrow().level, StressLevel::Critical);
    }

    #[test]
    fn one_below_saturates() {
        assert_eq!(StressLevel::Critical.one_below(), StressLevel::High);
        assert_eq!(StressLevel::Low.one_below(), StressLevel::Low);
    }
}
