//! Swarm Coherence Index.
//!
//! `SCI = 0.30 * precedent_agreement + 0.25 * health_alignment
//!      + 0.25 * communication_coherence + 0.20 * decision_consistency`,
//! each component a sliding-window mean in `[0, 1]`. Recomputed every 100
//! ticks by the host.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// SCI component weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SciWeights {
    /// Weight of precedent agreement.
    pub precedent_agreement: f64,
    /// Weight of health alignment.
    pub health_alignment: f64,
    /// Weight of communication coherence.
    pub communication_coherence: f64,
    /// Weight of decision consistency.
    pub decision_consistency: f64,
}

impl Default for SciWeights {
    fn default() -> Self {
        Self {
            precedent_agreement: 0.30,
            health_alignment: 0.25,
            communication_coherence: 0.25,
            decision_consistency: 0.20,
        }
    }
}

/// Default samples retained per component window.
pub const DEFAULT_WINDOW: usize = 64;

/// Ticks between SCI recomputations.
pub const RECOMPUTE_INTERVAL_TICKS: u64 = 100;

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<f64>,
}

impl Window {
    fn push(&mut self, sample: f64, capacity: usize) {
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.clamp(0.0, 1.0));
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let len = self.samples.len() as f64;
        self.samples.iter().sum::<f64>() / len
    }
}

#[derive(Debug, Default)]
struct Windows {
    precedent_agreement: Window,
    health_alignment: Window,
    communication_coherence: Window,
    decision_consistency: Window,
}

/// Sliding-window SCI computer.
pub struct SciComputer {
    weights: SciWeights,
    window: usize,
    state: Mutex<Windows>,
}

impl SciComputer {
    /// Creates a computer with the given weights and window size.
    #[must_use]
    pub fn new(weights: SciWeights, window: usize) -> Self {
        Self {
            weights,
            window: window.max(1),
            state: Mutex::new(Windows::default()),
        }
    }

    /// Records a precedent-agreement sample (fraction of evaluations that
    /// agreed with the established outcome).
    pub fn record_precedent_agreement(&self, sample: f64) {
        self.state
            .lock()
            .unwrap()
            .precedent_agreement
            .push(sample, self.window);
    }

    /// Records a health-alignment sample (1 minus the health spread).
    pub fn record_health_alignment(&self, sample: f64) {
        self.state
            .lock()
            .unwrap()
            .health_alignment
            .push(sample, self.window);
    }

    /// Records a communication-coherence sample (delivered versus
    /// dead-lettered traffic).
    pub fn record_communication_coherence(&self, sample: f64) {
        self.state
            .lock()
            .unwrap()
            .communication_coherence
            .push(sample, self.window);
    }

    /// Records a decision-consistency sample (pipeline outcomes matching
    /// precedent).
    pub fn record_decision_consistency(&self, sample: f64) {
        self.state
            .lock()
            .unwrap()
            .decision_consistency
            .push(sample, self.window);
    }

    /// Computes the current SCI.
    #[must_use]
    pub fn compute(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let sci = self.weights.precedent_agreement * state.precedent_agreement.mean()
            + self.weights.health_alignment * state.health_alignment.mean()
            + self.weights.communication_coherence * state.communication_coherence.mean()
            + self.weights.decision_consistency * state.decision_consistency.mean();
        sci.clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for SciComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SciComputer")
            .field("sci", &self.compute())
            .finish_non_exhaustive()
    }
}
