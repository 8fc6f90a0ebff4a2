//! Named circuit breakers with hysteresis.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::GovernorError;
use crate::stress::{StressLevel, StressSample, StressThresholds};

/// The four named breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    /// Guards spawn admission.
    Spawn,
    /// Guards lineage-extending operations.
    Lineage,
    /// Guards coherence broadcasts.
    SciBroadcast,
    /// Guards general resource allocation.
    Allocation,
}

impl BreakerKind {
    /// All breakers, in declaration order.
    pub const ALL: [Self; 4] = [Self::Spawn, Self::Lineage, Self::SciBroadcast, Self::Allocation];
}

impl std::fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spawn => "spawn",
            Self::Lineage => "lineage",
            Self::SciBroadcast => "sci_broadcast",
            Self::Allocation => "allocation",
        };
        write!(f, "{name}")
    }
}

/// Stress thresholds at which each breaker trips.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerThresholds {
    /// Spawn breaker trip threshold.
    #[serde(default = "default_spawn")]
    pub spawn: f64,

    /// Lineage breaker trip threshold.
    #[serde(default = "default_lineage")]
    pub lineage: f64,

    /// Coherence broadcast breaker trip threshold.
    #[serde(default = "default_sci_broadcast")]
    pub sci_broadcast: f64,

    /// Allocation breaker trip threshold.
    #[serde(default = "default_allocation")]
    pub allocation: f64,
}

const fn default_spawn() -> f64 {
    0.75
}

const fn default_lineage() -> f64 {
    0.75
}

const fn default_sci_broadcast() -> f64 {
    0.60
}

const fn default_allocation() -> f64 {
    0.85
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            spawn: default_spawn(),
            lineage: default_lineage(),
            sci_broadcast: default_sci_broadcast(),
            allocation: default_allocation(),
        }
    }
}

impl BreakerThresholds {
    fn threshold(&self, kind: BreakerKind) -> f64 {
        match kind {
            BreakerKind::Spawn => self.spawn,
            BreakerKind::Lineage => self.lineage,
            BreakerKind::SciBroadcast => self.sci_broadcast,
            BreakerKind::Allocation => self.allocation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    tripped_at: Option<StressLevel>,
}

/// The bank of four breakers.
///
/// A breaker trips when the stress value exceeds its threshold and resets
/// only when the discrete stress level falls one step below the level at
/// which it tripped.
#[derive(Debug)]
pub struct CircuitBreakers {
    thresholds: BreakerThresholds,
    states: Mutex<[BreakerState; 4]>,
}

impl CircuitBreakers {
    /// Creates a closed breaker bank.
    #[must_use]
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            thresholds,
            states: Mutex::new([BreakerState { tripped_at: None }; 4]),
        }
    }

    /// Feeds a stress sample through the bank.
    ///
    /// Returns the breakers that changed state: `(kind, now_open)`.
    pub fn observe(
        &self,
        sample: StressSample,
        thresholds: &StressThresholds,
    ) -> Vec<(BreakerKind, bool)> {
        let mut changes = Vec::new();
        let mut states = self.states.lock().unwrap();

        for (i, kind) in BreakerKind::ALL.into_iter().enumerate() {
            let state = &mut states[i];
            match state.tripped_at {
                None => {
                    if sample.value > self.thresholds.threshold(kind) {
                        // Reset requires the discrete level to fall one full
                        // step below the trip point's band.
                        let trip_level = thresholds.level_of(self.thresholds.threshold(kind));
                        state.tripped_at = Some(trip_level);
                        warn!(breaker = %kind, value = sample.value, "circuit breaker tripped");
                        changes.push((kind, true));
                    }
                },
                Some(trip_level) => {
                    if sample.level <= trip_level.one_below() {
                        state.tripped_at = None;
                        info!(breaker = %kind, level = %sample.level, "circuit breaker reset");
                        changes.push((kind, false));
                    }
                },
            }
        }
        changes
    }

    /// Returns true if the breaker is open.
    #[must_use]
    pub fn is_open(&self, kind: BreakerKind) -> bool {
        let states = self.states.lock().unwrap();
        let index = BreakerKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
        states[index].tripped_at.is_some()
    }

    /// Rejects with [`GovernorError::CircuitOpen`] if the breaker is open.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::CircuitOpen`] when tripped.
    pub fn check(&self, kind: BreakerKind) -> Result<(), GovernorError> {
        if self.is_open(kind) {
            Err(GovernorError::CircuitOpen { breaker: kind })
        } else {
            Ok(())
        }
    }
}
