//! Precedent court and the copy-on-write precedent book.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::{CapsuleId, CapsuleStatus};
use crate::clock::Tick;
use crate::registry::RegistrySnapshot;

/// Support ratio at or above which a case establishes a precedent.
pub const ESTABLISH_RATIO: f64 = 0.75;

/// Support ratio at or above which a case becomes advisory.
pub const ADVISORY_RATIO: f64 = 0.50;

/// Minimum fingerprint similarity for applying a precedent.
pub const APPLY_SIMILARITY: f64 = 0.80;

/// Minimum evaluator composite health.
const EVALUATOR_MIN_HEALTH: f64 = 0.5;

/// Stable precedent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecedentId(Uuid);

impl PrecedentId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PrecedentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome class a precedent recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeClass {
    /// The situation should be permitted.
    Permit,
    /// The situation should be denied.
    Deny,
}

/// Standing of a precedent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrecedentStanding {
    /// Binding on the arbiter stage.
    Established,
    /// Advisory only.
    Advisory,
}

/// An established or advisory precedent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precedent {
    /// Stable id.
    pub id: PrecedentId,

    /// Situation fingerprint (embedding from the external semantic engine).
    pub fingerprint: Vec<f32>,

    /// Recommended action.
    pub action: String,

    /// Recommended outcome class.
    pub outcome_class: OutcomeClass,

    /// Tick at which the precedent was established.
    pub established_tick: Tick,

    /// Number of supporting evaluations at establishment.
    pub support_count: u32,

    /// Observed success rate of applications, `[0, 1]`.
    pub success_rate: f64,

    /// Standing.
    pub standing: PrecedentStanding,
}

/// A case submitted to the precedent court.
#[derive(Debug, Clone)]
pub struct PrecedentCase {
    /// Situation fingerprint.
    pub fingerprint: Vec<f32>,

    /// Proposed action.
    pub action: String,

    /// Proposed outcome class.
    pub outcome_class: OutcomeClass,
}

/// One capsule's evaluation of a case.
#[derive(Debug, Clone, Copy)]
pub struct CaseEvaluation {
    /// The evaluating capsule.
    pub capsule_id: CapsuleId,

    /// Whether the capsule supports the proposed precedent.
    pub supports: bool,
}

/// Outcome of a case. A value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    /// The case established a precedent.
    Established {
        /// The new precedent's id.
        id: PrecedentId,
        /// The support ratio.
        support_ratio: f64,
    },
    /// The case became advisory.
    Advisory {
        /// The new precedent's id.
        id: PrecedentId,
        /// The support ratio.
        support_ratio: f64,
    },
    /// The case failed its support threshold.
    Rejected {
        /// The support ratio (0 when no eligible evaluations were cast).
        support_ratio: f64,
    },
}

/// Cosine similarity of two fingerprint vectors.
///
/// Returns 0.0 for mismatched lengths or zero-magnitude vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// The copy-on-write precedent book.
///
/// Readers clone the current `Arc` snapshot; writers replace it whole.
#[derive(Default)]
pub struct PrecedentBook {
    snapshot: RwLock<Arc<Vec<Precedent>>>,
}

impl PrecedentBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Precedent>> {
        self.snapshot.read().unwrap().clone()
    }

    /// Number of precedents in the book.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    /// Returns true if the book is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submits a case with its collected evaluations.
    ///
    /// Evaluations from capsules that are unhealthy (composite below 0.5),
    /// quarantined, or unknown to the registry snapshot are discarded.
    /// Support at or above 0.75 establishes; at or above 0.50 is advisory;
    /// anything lower rejects the case.
    pub fn submit_case(
        &self,
        case: PrecedentCase,
        evaluations: &[CaseEvaluation],
        registry: &RegistrySnapshot,
        now: Tick,
    ) -> CaseOutcome {
        let eligible: Vec<&CaseEvaluation> = evaluations
            .iter()
            .filter(|e| {
                registry.get(e.capsule_id).is_some_and(|view| {
                    view.status == CapsuleStatus::Active
                        && view.health_composite >= EVALUATOR_MIN_HEALTH
                })
            })
            .collect();

        if eligible.is_empty() {
            return CaseOutcome::Rejected { support_ratio: 0.0 };
        }

        #[allow(clippy::cast_precision_loss)]
        let support_ratio = eligible.iter().filter(|e| e.supports).count() as f64
            / eligible.len() as f64;

        let standing = if support_ratio >= ESTABLISH_RATIO {
            PrecedentStanding::Established
        } else if support_ratio >= ADVISORY_RATIO {
            PrecedentStanding::Advisory
        } else {
            return CaseOutcome::Rejected { support_ratio };
        };

        #[allow(clippy::cast_possible_truncation)]
        let support_count = eligible.iter().filter(|e| e.supports).count() as u32;

        let precedent = Precedent {
            id: PrecedentId::generate(),
            fingerprint: case.fingerprint,
            action: case.action,
            outcome_class: case.outcome_class,
            established_tick: now,
            support_count,
            success_rate: support_ratio,
            standing,
        };
        let id = precedent.id;

        {
            let mut guard = self.snapshot.write().unwrap();
            let mut next: Vec<Precedent> = guard.as_ref().clone();
            next.push(precedent);
            *guard = Arc::new(next);
        }

        match standing {
            PrecedentStanding::Established => CaseOutcome::Established { id, support_ratio },
            PrecedentStanding::Advisory => CaseOutcome::Advisory { id, support_ratio },
        }
    }

    /// Records an application outcome, updating the precedent's success
    /// rate as a running average.
    pub fn record_application(&self, id: PrecedentId, success: bool) {
        let mut guard = self.snapshot.write().unwrap();
        let mut next: Vec<Precedent> = guard.as_ref().clone();
        if let Some(p) = next.iter_mut().find(|p| p.id == id) {
            let weight = f64::from(p.support_count.max(1));
            let observed = if success { 1.0 } else { 0.0 };
            p.success_rate = (p.success_rate * weight + observed) / (weight + 1.0);
            p.support_count = p.support_count.saturating_add(1);
        }
        *guard = Arc::new(next);
    }
}

/// Finds the best applicable precedent for a fingerprint in a snapshot.
///
/// Only established precedents with similarity at or above
/// [`APPLY_SIMILARITY`] apply. Ties prefer the higher similarity, then the
/// lexicographically smallest id.
#[must_use]
pub fn best_match<'a>(
    snapshot: &'a [Precedent],
    fingerprint: &[f32],
) -> Option<(&'a Precedent, f64)> {
    let mut best: Option<(&Precedent, f64)> = None;
    for p in snapshot {
        if p.standing != PrecedentStanding::Established {
            continue;
        }
        let similarity = cosine_similarity(&p.fingerprint, fingerprint);
        if similarity < APPLY_SIMILARITY {
            continue;
        }
        let better = match best {
            None => true,
            Some((current, current_sim)) => {
                similarity > current_sim
                    || ((similarity - current_sim).abs() < f64::EPSILON && p.id < current.id)
            },
        };
        if better {
            best = Some((p, similarity));
        }
    }
    best
}
