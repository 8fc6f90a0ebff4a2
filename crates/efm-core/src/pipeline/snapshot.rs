//! The shared snapshot taken at pipeline entry.

use std::sync::Arc;

use crate::clock::Tick;
use crate::judicial::Precedent;
use crate::pipeline::motif::MotifLibrary;
use crate::registry::RegistrySnapshot;
use crate::stress::StressLevel;

/// The read-only state a request is evaluated against.
///
/// Stages are pure with respect to the request plus this snapshot; nothing
/// a concurrent writer publishes mid-flight changes a stage's inputs.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    /// Motif library at entry.
    pub motifs: Arc<MotifLibrary>,

    /// Precedent book at entry.
    pub precedents: Arc<Vec<Precedent>>,

    /// Registry view at entry.
    pub registry: RegistrySnapshot,

    /// Swarm coherence index at entry.
    pub sci: f64,

    /// Discrete stress level at entry.
    pub stress_level: StressLevel,

    /// Tick at entry.
    pub tick: Tick,
}

impl PipelineSnapshot {
    /// A quiescent snapshot for tests and cold starts.
    #[must_use]
    pub fn quiescent(motifs: Arc<MotifLibrary>, tick: Tick) -> Self {
        Self {
            motifs,
            precedents: Arc::new(Vec::new()),
            registry: RegistrySnapshot::default(),
            sci: 1.0,
            stress_level: StressLevel::Low,
            tick,
        }
    }
}
