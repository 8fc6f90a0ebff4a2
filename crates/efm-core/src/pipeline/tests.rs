//! Pipeline ordering, precedence, and timeout tests.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::audit::{
    AuditChain, AuditError, Durability, EventKind, MemoryAuditBackend, spawn_committer,
};
use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::ContentHasher;
use crate::governor::PriorityTier;
use crate::judicial::{CaseEvaluation, PrecedentBook, PrecedentCase, OutcomeClass};
use crate::registry::{CapsuleRegistry, CapsuleSlot};
use crate::tether::TetherTable;

struct Harness {
    chain: Arc<AuditChain>,
    pipeline: Pipeline,
}

fn harness_with(oracle: Arc<dyn ReasoningOracle>, budgets: StageBudgets) -> Harness {
    let chain = Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap());
    let (audit, _task) = spawn_committer(chain.clone(), Durability::Sync, 64);
    let pipeline = Pipeline::new(budgets, PipelineThresholds::default(), oracle, audit);
    Harness { chain, pipeline }
}

fn harness() -> Harness {
    harness_with(Arc::new(PolicyOracle), StageBudgets::default())
}

fn library_with_block(content: &[u8]) -> Arc<MotifLibrary> {
    Arc::new(MotifLibrary {
        anchors: vec![MotifLibrary::anchor_for("M1", content, MotifSeverity::Hostile)],
        danger_motifs: vec![DangerMotif {
            id: "D1".to_string(),
            embedding: vec![1.0, 0.0, 0.0],
            severity: MotifSeverity::Hostile,
        }],
    })
}

#[tokio::test]
async fn clean_request_permits_with_no_audit_entry() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));
    let request = Request::new(None, b"ordinary work".to_vec());

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Permit);
    assert_eq!(h.chain.head_seq(), 0);
}

#[tokio::test]
async fn reflex_blocks_known_pattern() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(library_with_block(b"forbidden input"), Tick::new(1));
    let request = Request::new(None, b"forbidden input".to_vec());

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, audit_seq } = outcome else {
        panic!("expected rejection, got {outcome:?}");
    };
    assert_eq!(stage, StageName::Reflex);
    assert_eq!(rejection.rule_id, "M1");
    assert_eq!(audit_seq, 1);

    let entries = h.chain.query_kind(EventKind::ReflexBlock, 10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload_json().unwrap()["rule_id"], "M1");
}

#[tokio::test]
async fn reflex_precedes_coherence_with_exactly_one_entry() {
    // A request that both matches a reflex anchor and would fail the
    // coherence gate terminates at Reflex; Coherence never executes.
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(library_with_block(b"hostile"), Tick::new(1));

    let mut request = Request::new(None, b"hostile".to_vec());
    request.declared_entropy = 0.95;

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    assert!(matches!(
        outcome,
        PipelineOutcome::Rejected {
            stage: StageName::Reflex,
            ..
        }
    ));

    assert_eq!(h.chain.head_seq(), 1);
    assert!(h.chain.query_kind(EventKind::CoherenceReject, 10).unwrap().is_empty());
}

#[tokio::test]
async fn intuition_rejects_similar_embedding() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(library_with_block(b"x"), Tick::new(1));

    let mut request = Request::new(None, b"novel phrasing".to_vec());
    request.embedding = Some(vec![0.95, 0.05, 0.0]);

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Intuition);
    assert_eq!(rejection.rule_id, "D1");
    let similarity = rejection.detail["similarity"].as_f64().unwrap();
    assert!(similarity >= 0.75);
}

#[tokio::test]
async fn dissimilar_embedding_passes_intuition() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(library_with_block(b"x"), Tick::new(1));

    let mut request = Request::new(None, b"novel phrasing".to_vec());
    request.embedding = Some(vec![0.0, 1.0, 0.0]);

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Permit);
}

#[tokio::test]
async fn coherence_rejects_high_entropy() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));

    let mut request = Request::new(None, b"valid but dissonant".to_vec());
    request.declared_entropy = 0.9;

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Coherence);
    assert!(rejection.detail["delta"].as_f64().unwrap() > 0.80);
}

#[tokio::test]
async fn constitutional_hint_projects_max_entropy() {
    let h = harness();
    let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));

    let mut request = Request::new(None, b"subtle".to_vec());
    request.flags.targets_human_harm = true;

    // The coherence gate fires before the arbiter sees the same flag.
    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Coherence);
    assert!((rejection.detail["delta"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(rejection.severity, MotifSeverity::Critical);
}

#[tokio::test]
async fn swarm_surcharge_applies_under_low_sci() {
    let h = harness();
    let mut snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));
    snapshot.sci = 0.55;

    let mut request = Request::new(None, b"broadcast conflicting information".to_vec());
    request.flags.affects_swarm = true;
    request.declared_entropy = 0.6;

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    assert!(matches!(
        outcome,
        PipelineOutcome::Rejected {
            stage: StageName::Coherence,
            ..
        }
    ));
}

#[tokio::test]
async fn arbiter_denies_on_binding_precedent() {
    let h = harness();

    // Establish a high-confidence Deny precedent.
    let registry = CapsuleRegistry::new();
    let mut evaluators = Vec::new();
    for _ in 0..4 {
        let id = CapsuleId::generate();
        registry
            .insert(CapsuleSlot::new(
                id,
                None,
                0,
                ContentHasher::hash("efm.test", id.as_string().as_bytes()),
                Tick::ZERO,
                PriorityTier::Normal,
                TetherTable::default().low,
            ))
            .unwrap();
        evaluators.push(CaseEvaluation {
            capsule_id: id,
            supports: true,
        });
    }
    let book = PrecedentBook::new();
    book.submit_case(
        PrecedentCase {
            fingerprint: vec![0.0, 1.0, 0.0],
            action: "deny raw disk access".to_string(),
            outcome_class: OutcomeClass::Deny,
        },
        &evaluators,
        &registry.snapshot(),
        Tick::new(1),
    );

    let mut snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(2));
    snapshot.precedents = book.snapshot();

    let mut request = Request::new(None, b"open /dev/sda".to_vec());
    request.embedding = Some(vec![0.0, 0.98, 0.02]);

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Arbiter);
    assert_eq!(rejection.reason, "precedent");
}

#[tokio::test]
async fn deliberation_enforces_risk_tether() {
    let h = harness();

    let registry = CapsuleRegistry::new();
    let id = CapsuleId::generate();
    registry
        .insert(CapsuleSlot::new(
            id,
            None,
            0,
            ContentHasher::hash("efm.test", b"c"),
            Tick::ZERO,
            PriorityTier::Normal,
            TetherTable::default().critical,
        ))
        .unwrap();

    let mut snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));
    snapshot.registry = registry.snapshot();

    let mut request = Request::new(Some(id), b"risky move".to_vec());
    request.risk = 0.5;

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Deliberation);
    assert_eq!(rejection.reason, "risk_exceeds_tolerance");
}

struct RefusingOracle;

impl ReasoningOracle for RefusingOracle {
    fn consult<'a>(
        &'a self,
        _request: &'a Request,
        _snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, OracleDecision> {
        Box::pin(async {
            OracleDecision::Refuse {
                reason: "insufficient justification".to_string(),
            }
        })
    }
}

#[tokio::test]
async fn oracle_refusal_terminates_at_deliberation() {
    let h = harness_with(Arc::new(RefusingOracle), StageBudgets::default());
    let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));
    let request = Request::new(None, b"anything".to_vec());

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::Rejected { stage, rejection, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(stage, StageName::Deliberation);
    assert_eq!(rejection.reason, "oracle_refused");
    assert_eq!(
        h.chain.query_kind(EventKind::DeliberationRefuse, 10).unwrap().len(),
        1
    );
}

struct StalledOracle;

impl ReasoningOracle for StalledOracle {
    fn consult<'a>(
        &'a self,
        _request: &'a Request,
        _snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, OracleDecision> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            OracleDecision::Approve
        })
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_oracle_times_out_with_typed_outcome() {
    let h = harness_with(Arc::new(StalledOracle), StageBudgets::default());
    let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::new(1));
    let request = Request::new(None, b"anything".to_vec());

    let outcome = h.pipeline.submit(&request, &snapshot).await.unwrap();
    let PipelineOutcome::TimedOut { stage, .. } = outcome else {
        panic!("expected timeout, got {outcome:?}");
    };
    assert_eq!(stage, StageName::Deliberation);

    let entries = h.chain.query_kind(EventKind::PipelineTimeout, 10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].payload_json().unwrap()["error"],
        "LatencyBudgetExceeded"
    );
}

#[tokio::test]
async fn overloaded_audit_surfaces_as_typed_error() {
    // A committer that is stopped makes every terminal verdict fail with a
    // typed error instead of silently losing the audit entry.
    let chain = Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap());
    let (audit, task) = spawn_committer(chain, Durability::Sync, 1);
    task.abort();
    let _ = task.await;

    let pipeline = Pipeline::new(
        StageBudgets::default(),
        PipelineThresholds::default(),
        Arc::new(PolicyOracle),
        audit,
    );

    let snapshot = PipelineSnapshot::quiescent(library_with_block(b"blocked"), Tick::new(1));
    let request = Request::new(None, b"blocked".to_vec());

    let result = pipeline.submit(&request, &snapshot).await;
    assert!(matches!(
        result,
        Err(AuditError::Overloaded | AuditError::CommitterStopped)
    ));
}
