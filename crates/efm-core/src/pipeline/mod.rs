//! Five-stage decision pipeline.
//!
//! Every external request is filtered through Reflex, Intuition,
//! Coherence, Arbiter, and Deliberation, in that order. Each stage has a
//! hard latency budget and a rejection contract:
//!
//! | Stage        | Budget  | Rejects on                                  |
//! |--------------|---------|---------------------------------------------|
//! | Reflex       | 10 ms   | exact match against pre-hashed anchors       |
//! | Intuition    | 20 ms   | similarity to a learned danger motif         |
//! | Coherence    | 30 ms   | projected entropy delta above threshold      |
//! | Arbiter      | 100 ms  | constitutional predicate or binding precedent |
//! | Deliberation | request | policy check or oracle refusal               |
//!
//! Outcomes are values, never errors. A terminated request produces
//! exactly one audit entry; passes produce none.

mod driver;
mod motif;
mod oracle;
mod outcome;
mod request;
mod snapshot;
mod stages;

#[cfg(test)]
mod tests;

pub use driver::{Pipeline, PipelineThresholds, StageBudgets};
pub use motif::{DangerMotif, MotifLibrary, MotifSeverity, ReflexAnchor};
pub use oracle::{BoxFuture, OracleDecision, PolicyOracle, ReasoningOracle};
pub use outcome::{PipelineOutcome, Rejection, StageName, StageVerdict};
pub use request::{PredicateFlags, Request, RequestId};
pub use snapshot::PipelineSnapshot;
pub use stages::{
    ArbiterStage, CoherenceStage, DeliberationStage, IntuitionStage, ReflexStage, Stage,
};
