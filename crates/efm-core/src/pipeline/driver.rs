//! The pipeline driver: ordered stage execution under latency budgets.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::audit::{AuditError, AuditEvent, AuditHandle, AuditWriter, EventKind};
use crate::pipeline::oracle::ReasoningOracle;
use crate::pipeline::outcome::{PipelineOutcome, StageName, StageVerdict};
use crate::pipeline::request::Request;
use crate::pipeline::snapshot::PipelineSnapshot;
use crate::pipeline::stages::{
    ArbiterStage, CoherenceStage, DeliberationStage, IntuitionStage, ReflexStage, Stage,
};

/// Per-stage latency budgets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudgets {
    /// Reflex budget.
    #[serde(default = "default_reflex_ms")]
    pub reflex_ms: u64,

    /// Intuition budget.
    #[serde(default = "default_intuition_ms")]
    pub intuition_ms: u64,

    /// Coherence budget.
    #[serde(default = "default_coherence_ms")]
    pub coherence_ms: u64,

    /// Arbiter budget.
    #[serde(default = "default_arbiter_ms")]
    pub arbiter_ms: u64,

    /// Deliberation budget (the request timeout; the stage itself is
    /// open-ended).
    #[serde(default = "default_deliberation_ms")]
    pub deliberation_ms: u64,
}

const fn default_reflex_ms() -> u64 {
    10
}

const fn default_intuition_ms() -> u64 {
    20
}

const fn default_coherence_ms() -> u64 {
    30
}

const fn default_arbiter_ms() -> u64 {
    100
}

const fn default_deliberation_ms() -> u64 {
    5_000
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            reflex_ms: default_reflex_ms(),
            intuition_ms: default_intuition_ms(),
            coherence_ms: default_coherence_ms(),
            arbiter_ms: default_arbiter_ms(),
            deliberation_ms: default_deliberation_ms(),
        }
    }
}

impl StageBudgets {
    /// The budget for a stage.
    #[must_use]
    pub const fn for_stage(&self, stage: StageName) -> Duration {
        let ms = match stage {
            StageName::Reflex => self.reflex_ms,
            StageName::Intuition => self.intuition_ms,
            StageName::Coherence => self.coherence_ms,
            StageName::Arbiter => self.arbiter_ms,
            StageName::Deliberation => self.deliberation_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Pipeline thresholds beyond the budgets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineThresholds {
    /// Intuition similarity threshold.
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f64,

    /// Coherence entropy delta threshold.
    #[serde(default = "default_entropy")]
    pub entropy_threshold: f64,
}

const fn default_similarity() -> f64 {
    0.75
}

const fn default_entropy() -> f64 {
    0.80
}

impl Default for PipelineThresholds {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity(),
            entropy_threshold: default_entropy(),
        }
    }
}

/// The five-stage decision pipeline.
///
/// A request either passes every stage in order or terminates at the first
/// rejecting stage; no later stage executes after termination, and the
/// earlier stage always wins when multiple stages would reject
/// (constitutional precedence). Exactly one audit entry is produced per
/// terminated request; passes are not logged.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    budgets: StageBudgets,
    audit: AuditHandle,
}

impl Pipeline {
    /// Builds the standard five-stage pipeline.
    #[must_use]
    pub fn new(
        budgets: StageBudgets,
        thresholds: PipelineThresholds,
        oracle: Arc<dyn ReasoningOracle>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            stages: vec![
                Box::new(ReflexStage),
                Box::new(IntuitionStage::new(thresholds.similarity_threshold)),
                Box::new(CoherenceStage::new(thresholds.entropy_threshold)),
                Box::new(ArbiterStage),
                Box::new(DeliberationStage::new(oracle)),
            ],
            budgets,
            audit,
        }
    }

    /// Runs a request through the pipeline against an entry snapshot.
    ///
    /// Budget overruns at Reflex, Intuition, and Coherence are conservative
    /// failures: the stage's verdict is discarded and the pipeline
    /// escalates to the next stage. Overruns at Arbiter and Deliberation
    /// terminate the request with a typed timeout.
    ///
    /// # Errors
    ///
    /// Returns an error only when the terminating audit entry cannot be
    /// committed: [`AuditError::Overloaded`] is the admission-control
    /// backpressure signal.
    pub async fn submit(
        &self,
        request: &Request,
        snapshot: &PipelineSnapshot,
    ) -> Result<PipelineOutcome, AuditError> {
        for stage in &self.stages {
            let name = stage.name();
            let budget = self.budgets.for_stage(name);

            match timeout(budget, stage.evaluate(request, snapshot)).await {
                Ok(StageVerdict::Pass) => {},
                Ok(StageVerdict::Reject(rejection)) => {
                    warn!(
                        request = %request.id,
                        stage = %name,
                        rule = %rejection.rule_id,
                        "pipeline terminated request"
                    );
                    let (audit_seq, _) = self
                        .audit
                        .append(AuditEvent::new(
                            name.rejection_kind(),
                            snapshot.tick,
                            AuditWriter::system(format!("pipeline.{name}")),
                            request.capsule_id,
                            &json!({
                                "request_id": request.id.to_string(),
                                "verdict": name.verdict_verb(),
                                "reason": rejection.reason,
                                "rule_id": rejection.rule_id,
                                "detail": rejection.detail,
                            }),
                        ))
                        .await?;
                    return Ok(PipelineOutcome::Rejected {
                        stage: name,
                        rejection,
                        audit_seq,
                    });
                },
                Err(_elapsed) if name.timeout_escalates() => {
                    // Conservative failure: the fast path could not decide
                    // in budget, so the slower stages take over.
                    debug!(request = %request.id, stage = %name, "stage budget exceeded, escalating");
                },
                Err(_elapsed) => {
                    warn!(request = %request.id, stage = %name, "stage budget exceeded, rejecting");
                    let (audit_seq, _) = self
                        .audit
                        .append(AuditEvent::new(
                            EventKind::PipelineTimeout,
                            snapshot.tick,
                            AuditWriter::system(format!("pipeline.{name}")),
                            request.capsule_id,
                            &json!({
                                "request_id": request.id.to_string(),
                                "error": "LatencyBudgetExceeded",
                                "budget_ms": budget.as_millis() as u64,
                            }),
                        ))
                        .await?;
                    return Ok(PipelineOutcome::TimedOut {
                        stage: name,
                        audit_seq,
                    });
                },
            }
        }

        Ok(PipelineOutcome::Permit)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("budgets", &self.budgets)
            .finish_non_exhaustive()
    }
}
