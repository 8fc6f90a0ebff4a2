//! Judicial subsystem: precedent court, quorum voting, conflict tribunal,
//! and the swarm coherence index.
//!
//! Precedents are the swarm's settled case law: established mappings from a
//! situation fingerprint to a recommended action. The precedent book is
//! read-mostly with copy-on-write publication; pipeline stages take a
//! snapshot at entry and never observe a half-applied update.

mod precedent;
mod quorum;
mod sci;
mod tribunal;

pub use precedent::{
    APPLY_SIMILARITY, CaseEvaluation, CaseOutcome, OutcomeClass, Precedent, PrecedentBook,
    PrecedentCase, PrecedentId, PrecedentStanding, best_match, cosine_similarity,
};
pub use quorum::{QuorumConfig, QuorumDecision, QuorumPoll};
pub use sci::{DEFAULT_WINDOW, RECOMPUTE_INTERVAL_TICKS, SciComputer, SciWeights};
pub use tribunal::{Tribunal, TribunalConfig, TribunalVerdict};
