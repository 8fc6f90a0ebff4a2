//! The five pipeline stages.

use std::sync::Arc;

use serde_json::json;

use crate::judicial::{OutcomeClass, best_match, cosine_similarity};
use crate::pipeline::motif::MotifSeverity;
use crate::pipeline::oracle::{BoxFuture, OracleDecision, ReasoningOracle};
use crate::pipeline::outcome::{Rejection, StageName, StageVerdict};
use crate::pipeline::request::Request;
use crate::pipeline::snapshot::PipelineSnapshot;

/// Precedent success rate treated as high confidence by the arbiter.
const PRECEDENT_CONFIDENCE: f64 = 0.80;

/// SCI below which swarm-affecting requests pick up an entropy surcharge.
const SWARM_FRAGILITY_SCI: f64 = 0.60;

/// Entropy surcharge applied to swarm-affecting requests under fragility.
const SWARM_SURCHARGE: f64 = 0.25;

/// One pipeline stage.
///
/// Stages are pure with respect to the request and the snapshot taken at
/// pipeline entry; evaluation never mutates shared state.
pub trait Stage: Send + Sync {
    /// The stage's position in the pipeline.
    fn name(&self) -> StageName;

    /// Evaluates a request against the entry snapshot.
    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict>;
}

/// Reflex: exact pattern match against pre-hashed anchors.
#[derive(Debug, Default)]
pub struct ReflexStage;

impl Stage for ReflexStage {
    fn name(&self) -> StageName {
        StageName::Reflex
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict> {
        Box::pin(async move {
            let hash = request.content_hash();
            let candidates: Vec<Rejection> = snapshot
                .motifs
                .matching_anchors(&hash)
                .into_iter()
                .map(|anchor| Rejection {
                    reason: "pattern_match".to_string(),
                    rule_id: anchor.id.clone(),
                    severity: anchor.severity,
                    detail: json!({ "anchor": anchor.anchor.to_string() }),
                })
                .collect();

            match Rejection::pick(candidates) {
                Some(rejection) => StageVerdict::Reject(rejection),
                None => StageVerdict::Pass,
            }
        })
    }
}

/// Intuition: similarity against learned danger motifs.
#[derive(Debug)]
pub struct IntuitionStage {
    similarity_threshold: f64,
}

impl IntuitionStage {
    /// Creates the stage with a similarity threshold.
    #[must_use]
    pub const fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }
}

impl Stage for IntuitionStage {
    fn name(&self) -> StageName {
        StageName::Intuition
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict> {
        Box::pin(async move {
            let Some(embedding) = &request.embedding else {
                return StageVerdict::Pass;
            };

            let candidates: Vec<Rejection> = snapshot
                .motifs
                .danger_motifs
                .iter()
                .filter_map(|motif| {
                    let similarity = cosine_similarity(&motif.embedding, embedding);
                    (similarity >= self.similarity_threshold).then(|| Rejection {
                        reason: "danger_motif".to_string(),
                        rule_id: motif.id.clone(),
                        severity: motif.severity,
                        detail: json!({ "similarity": similarity }),
                    })
                })
                .collect();

            match Rejection::pick(candidates) {
                Some(rejection) => StageVerdict::Reject(rejection),
                None => StageVerdict::Pass,
            }
        })
    }
}

/// Coherence: projected entropy gate.
#[derive(Debug)]
pub struct CoherenceStage {
    entropy_threshold: f64,
}

impl CoherenceStage {
    /// Creates the stage with an entropy delta threshold.
    #[must_use]
    pub const fn new(entropy_threshold: f64) -> Self {
        Self { entropy_threshold }
    }

    /// Projects the entropy delta a request would introduce.
    ///
    /// Any hint of a constitutional violation projects maximum entropy.
    /// Swarm-affecting requests pick up a surcharge while coherence is
    /// fragile.
    #[must_use]
    pub fn projected_delta(request: &Request, snapshot: &PipelineSnapshot) -> f64 {
        if request.flags.any_constitutional() {
            return 1.0;
        }
        let mut delta = request.declared_entropy;
        if request.flags.affects_swarm && snapshot.sci < SWARM_FRAGILITY_SCI {
            delta += SWARM_SURCHARGE;
        }
        delta.clamp(0.0, 1.0)
    }
}

impl Stage for CoherenceStage {
    fn name(&self) -> StageName {
        StageName::Coherence
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict> {
        Box::pin(async move {
            let delta = Self::projected_delta(request, snapshot);
            if delta > self.entropy_threshold {
                let severity = if (delta - 1.0).abs() < f64::EPSILON {
                    MotifSeverity::Critical
                } else {
                    MotifSeverity::Elevated
                };
                return StageVerdict::Reject(Rejection {
                    reason: "dissonant".to_string(),
                    rule_id: "entropy_delta".to_string(),
                    severity,
                    detail: json!({ "delta": delta }),
                });
            }
            StageVerdict::Pass
        })
    }
}

/// Arbiter: constitutional predicates and binding precedent.
#[derive(Debug, Default)]
pub struct ArbiterStage;

impl Stage for ArbiterStage {
    fn name(&self) -> StageName {
        StageName::Arbiter
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict> {
        Box::pin(async move {
            let mut candidates = Vec::new();

            if request.flags.targets_human_harm {
                candidates.push(Rejection {
                    reason: "commandment".to_string(),
                    rule_id: "C1".to_string(),
                    severity: MotifSeverity::Critical,
                    detail: json!({ "predicate": "targets_human_harm" }),
                });
            }
            if request.flags.disables_override {
                candidates.push(Rejection {
                    reason: "commandment".to_string(),
                    rule_id: "C1".to_string(),
                    severity: MotifSeverity::Critical,
                    detail: json!({ "predicate": "disables_override" }),
                });
            }
            if request.flags.modifies_constitution {
                candidates.push(Rejection {
                    reason: "commandment".to_string(),
                    rule_id: "C2".to_string(),
                    severity: MotifSeverity::Critical,
                    detail: json!({ "predicate": "modifies_constitution" }),
                });
            }
            if request.flags.tampers_genesis {
                candidates.push(Rejection {
                    reason: "commandment".to_string(),
                    rule_id: "C2".to_string(),
                    severity: MotifSeverity::Critical,
                    detail: json!({ "predicate": "tampers_genesis" }),
                });
            }

            if let Some(embedding) = &request.embedding {
                if let Some((precedent, similarity)) = best_match(&snapshot.precedents, embedding) {
                    if precedent.outcome_class == OutcomeClass::Deny
                        && precedent.success_rate >= PRECEDENT_CONFIDENCE
                    {
                        candidates.push(Rejection {
                            reason: "precedent".to_string(),
                            rule_id: precedent.id.to_string(),
                            severity: MotifSeverity::Hostile,
                            detail: json!({
                                "similarity": similarity,
                                "action": precedent.action,
                            }),
                        });
                    }
                }
            }

            match Rejection::pick(candidates) {
                Some(rejection) => StageVerdict::Reject(rejection),
                None => StageVerdict::Pass,
            }
        })
    }
}

/// Deliberation: local policy checks plus the external reasoning oracle.
pub struct DeliberationStage {
    oracle: Arc<dyn ReasoningOracle>,
}

impl DeliberationStage {
    /// Creates the stage over an oracle.
    #[must_use]
    pub fn new(oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self { oracle }
    }
}

impl std::fmt::Debug for DeliberationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliberationStage").finish_non_exhaustive()
    }
}

impl Stage for DeliberationStage {
    fn name(&self) -> StageName {
        StageName::Deliberation
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, StageVerdict> {
        Box::pin(async move {
            // Policy: the requesting capsule's risk tether binds.
            if let Some(capsule_id) = request.capsule_id {
                if let Some(view) = snapshot.registry.get(capsule_id) {
                    if request.risk > view.tether.risk_tolerance {
                        return StageVerdict::Reject(Rejection {
                            reason: "risk_exceeds_tolerance".to_string(),
                            rule_id: "tether.risk_tolerance".to_string(),
                            severity: MotifSeverity::Elevated,
                            detail: json!({
                                "risk": request.risk,
                                "tolerance": view.tether.risk_tolerance,
                            }),
                        });
                    }
                }
            }

            match self.oracle.consult(request, snapshot).await {
                OracleDecision::Approve => StageVerdict::Pass,
                OracleDecision::Refuse { reason } => StageVerdict::Reject(Rejection {
                    reason: "oracle_refused".to_string(),
                    rule_id: "oracle".to_string(),
                    severity: MotifSeverity::Hostile,
                    detail: json!({ "oracle_reason": reason }),
                }),
            }
        })
    }
}
