//! Pipeline stage names, verdicts, and outcomes.

use serde::{Deserialize, Serialize};

use crate::audit::EventKind;
use crate::pipeline::motif::MotifSeverity;

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageName {
    /// Exact pattern match against pre-hashed anchors.
    Reflex,
    /// Similarity against learned danger motifs.
    Intuition,
    /// Projected entropy gate.
    Coherence,
    /// Constitutional predicates and binding precedent.
    Arbiter,
    /// Policy checks and the external reasoning oracle.
    Deliberation,
}

impl StageName {
    /// Audit tag for a terminal verdict at this stage.
    #[must_use]
    pub const fn rejection_kind(self) -> EventKind {
        match self {
            Self::Reflex => EventKind::ReflexBlock,
            Self::Intuition => EventKind::IntuitionReject,
            Self::Coherence => EventKind::CoherenceReject,
            Self::Arbiter => EventKind::ArbiterDeny,
            Self::Deliberation => EventKind::DeliberationRefuse,
        }
    }

    /// Verdict verb used in operator-facing output.
    #[must_use]
    pub const fn verdict_verb(self) -> &'static str {
        match self {
            Self::Reflex => "BLOCK",
            Self::Intuition => "REJECT",
            Self::Coherence => "REJECT",
            Self::Arbiter => "DENY",
            Self::Deliberation => "REFUSE",
        }
    }

    /// Whether a budget overrun at this stage is a conservative failure
    /// (escalate to the next stage) rather than a terminal timeout.
    #[must_use]
    pub const fn timeout_escalates(self) -> bool {
        matches!(self, Self::Reflex | Self::Intuition | Self::Coherence)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reflex => "reflex",
            Self::Intuition => "intuition",
            Self::Coherence => "coherence",
            Self::Arbiter => "arbiter",
            Self::Deliberation => "deliberation",
        };
        f.write_str(name)
    }
}

/// A stage's verdict on a request.
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    /// The stage found no objection.
    Pass,
    /// The stage rejects the request.
    Reject(Rejection),
}

/// Details of a stage rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Machine-readable reason tag.
    pub reason: String,

    /// Rule, pattern, motif, commandment, or precedent id that fired.
    pub rule_id: String,

    /// Severity for stage-internal tie-breaking.
    pub severity: MotifSeverity,

    /// Additional detail (similarity, delta, oracle reason).
    pub detail: serde_json::Value,
}

impl Rejection {
    /// Picks the winning rejection when several conditions fire inside one
    /// stage: highest severity first, then lexicographically smallest rule
    /// id.
    #[must_use]
    pub fn pick(mut candidates: Vec<Self>) -> Option<Self> {
        candidates.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        candidates.into_iter().next()
    }
}

/// Final outcome of a request. A value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every stage passed.
    Permit,
    /// A stage terminated the request.
    Rejected {
        /// The terminating stage.
        stage: StageName,
        /// The winning rejection.
        rejection: Rejection,
        /// Sequence number of the audit entry witnessing the rejection.
        audit_seq: u64,
    },
    /// Arbiter or Deliberation exceeded its latency budget.
    TimedOut {
        /// The stage that overran.
        stage: StageName,
        /// Sequence number of the audit entry witnessing the timeout.
        audit_seq: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(rule_id: &str, severity: MotifSeverity) -> Rejection {
        Rejection {
            reason: "test".to_string(),
            rule_id: rule_id.to_string(),
            severity,
            detail: serde_json::Value::Null,
        }
    }

    #[test]
    fn tie_break_prefers_severity_then_id() {
        let winner = Rejection::pick(vec![
            rejection("M9", MotifSeverity::Elevated),
            rejection("M2", MotifSeverity::Hostile),
            rejection("M5", MotifSeverity::Hostile),
        ])
        .unwrap();
        assert_eq!(winner.rule_id, "M2");
        assert_eq!(winner.severity, MotifSeverity::Hostile);
    }

    #[test]
    fn early_stage_timeouts_escalate() {
        assert!(StageName::Reflex.timeout_escalates());
        assert!(StageName::Coherence.timeout_escalates());
        assert!(!StageName::Arbiter.timeout_escalates());
        assert!(!StageName::Deliberation.timeout_escalates());
    }

    #[test]
    fn stage_order_matches_declaration() {
        assert!(StageName::Reflex < StageName::Intuition);
        assert!(StageName::Arbiter < StageName::Deliberation);
    }
}
