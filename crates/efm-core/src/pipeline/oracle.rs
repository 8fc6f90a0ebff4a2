//! The external reasoning oracle consulted by the deliberation stage.

use std::future::Future;
use std::pin::Pin;

use crate::pipeline::request::Request;
use crate::pipeline::snapshot::PipelineSnapshot;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An oracle decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleDecision {
    /// The oracle has no objection.
    Approve,
    /// The oracle refuses the request.
    Refuse {
        /// The oracle's stated reason.
        reason: String,
    },
}

/// External reasoning consulted during deliberation.
///
/// The oracle is opaque to the runtime. Calls are wrapped in the
/// deliberation timeout; dropping the future is the cancel signal, and
/// implementations must not hold resources across an await that survive
/// cancellation.
pub trait ReasoningOracle: Send + Sync {
    /// Consults the oracle about a request.
    fn consult<'a>(
        &'a self,
        request: &'a Request,
        snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, OracleDecision>;
}

/// The default oracle: local policy only, never blocks.
///
/// Approves everything that reached deliberation; the earlier stages and
/// the deliberation policy checks carry the enforcement.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyOracle;

impl ReasoningOracle for PolicyOracle {
    fn consult<'a>(
        &'a self,
        _request: &'a Request,
        _snapshot: &'a PipelineSnapshot,
    ) -> BoxFuture<'a, OracleDecision> {
        Box::pin(async { OracleDecision::Approve })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safety(_: &dyn ReasoningOracle) {}

    #[tokio::test]
    async fn policy_oracle_approves() {
        use std::sync::Arc;

        use crate::clock::Tick;
        use crate::pipeline::motif::MotifLibrary;

        let oracle = PolicyOracle;
        let request = Request::new(None, b"anything".to_vec());
        let snapshot = PipelineSnapshot::quiescent(Arc::new(MotifLibrary::default()), Tick::ZERO);
        assert_eq!(oracle.consult(&request, &snapshot).await, OracleDecision::Approve);
    }
}
