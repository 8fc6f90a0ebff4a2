//! Audit event type tags.

use serde::{Deserialize, Serialize};

/// Typed tag identifying what an audit entry witnesses.
///
/// Tags have canonical wire names (`PULSE_REJECTED`, `REFLEX_BLOCK`, ...)
/// used in storage and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventKind {
    /// A capsule's genesis record was registered.
    CapsuleGenesis,
    /// Spawn admission granted.
    SpawnAdmitted,
    /// Spawn admission denied (one of S1..S6 failed).
    SpawnDenied,
    /// A registered child failed to pulse in its first-pulse window.
    SpawnRolledBack,
    /// A pulse failed validation.
    PulseRejected,
    /// A capsule missed its pulse window.
    LivenessViolation,
    /// A capsule exhausted its missed-pulse allowance and was terminated.
    LivenessFailure,
    /// A capsule entered quarantine.
    QuarantineEntered,
    /// A capsule completed probation and recovered.
    QuarantineRecovered,
    /// A capsule was terminated.
    CapsuleTerminated,
    /// Reflex stage blocked a request.
    ReflexBlock,
    /// Intuition stage rejected a request.
    IntuitionReject,
    /// Coherence stage rejected a request.
    CoherenceReject,
    /// Arbiter stage denied a request.
    ArbiterDeny,
    /// Deliberation stage refused a request.
    DeliberationRefuse,
    /// Arbiter or Deliberation exceeded its latency budget.
    PipelineTimeout,
    /// The discrete stress level changed.
    StressLevelChanged,
    /// Tether vectors were republished for a new stress level.
    TetherUpdated,
    /// A circuit breaker tripped.
    BreakerTripped,
    /// A circuit breaker reset after hysteresis.
    BreakerReset,
    /// A sandboxed capsule attempted a revoked operation.
    EscapeAttempt,
    /// A capsule was admitted to a sandbox session.
    SandboxAdmitted,
    /// A sandbox session escalated to a deeper level.
    SandboxEscalated,
    /// A sandbox session was released.
    SandboxReleased,
    /// A message expired or was unroutable.
    MessageDeadLetter,
    /// A precedent case reached the establishment threshold.
    PrecedentEstablished,
    /// A precedent case failed its support threshold.
    PrecedentRejected,
    /// A quorum vote concluded.
    QuorumDecided,
    /// A conflict tribunal returned a verdict.
    TribunalVerdict,
    /// The swarm coherence index was recomputed.
    SciRecomputed,
    /// An operator override command was received (logged before effect).
    GardenerOverride,
    /// A system halt was committed.
    SystemHaltCommitted,
    /// The process began shutdown.
    SystemShutdown,
    /// A runtime invariant was violated (fatal).
    InvariantViolation,
}

impl EventKind {
    /// Canonical wire name of the tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CapsuleGenesis => "CAPSULE_GENESIS",
            Self::SpawnAdmitted => "SPAWN_ADMITTED",
            Self::SpawnDenied => "SPAWN_DENIED",
            Self::SpawnRolledBack => "SPAWN_ROLLED_BACK",
            Self::PulseRejected => "PULSE_REJECTED",
            Self::LivenessViolation => "LIVENESS_VIOLATION",
            Self::LivenessFailure => "LIVENESS_FAILURE",
            Self::QuarantineEntered => "QUARANTINE_ENTERED",
            Self::QuarantineRecovered => "QUARANTINE_RECOVERED",
            Self::CapsuleTerminated => "CAPSULE_TERMINATED",
            Self::ReflexBlock => "REFLEX_BLOCK",
            Self::IntuitionReject => "INTUITION_REJECT",
            Self::CoherenceReject => "COHERENCE_REJECT",
            Self::ArbiterDeny => "ARBITER_DENY",
            Self::DeliberationRefuse => "DELIBERATION_REFUSE",
            Self::PipelineTimeout => "PIPELINE_TIMEOUT",
            Self::StressLevelChanged => "STRESS_LEVEL_CHANGED",
            Self::TetherUpdated => "TETHER_UPDATED",
            Self::BreakerTripped => "BREAKER_TRIPPED",
            Self::BreakerReset => "BREAKER_RESET",
            Self::EscapeAttempt => "ESCAPE_ATTEMPT",
            Self::SandboxAdmitted => "SANDBOX_ADMITTED",
            Self::SandboxEscalated => "SANDBOX_ESCALATED",
            Self::SandboxReleased => "SANDBOX_RELEASED",
            Self::MessageDeadLetter => "MESSAGE_DEAD_LETTER",
            Self::PrecedentEstablished => "PRECEDENT_ESTABLISHED",
            Self::PrecedentRejected => "PRECEDENT_REJECTED",
            Self::QuorumDecided => "QUORUM_DECIDED",
            Self::TribunalVerdict => "TRIBUNAL_VERDICT",
            Self::SciRecomputed => "SCI_RECOMPUTED",
            Self::GardenerOverride => "GARDENER_OVERRIDE",
            Self::SystemHaltCommitted => "SYSTEM_HALT_COMMITTED",
            Self::SystemShutdown => "SYSTEM_SHUTDOWN",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }

    /// Lifecycle tags are retained forever regardless of retention policy.
    #[must_use]
    pub const fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Self::CapsuleGenesis
                | Self::SpawnAdmitted
                | Self::SpawnRolledBack
                | Self::LivenessFailure
                | Self::QuarantineEntered
                | Self::QuarantineRecovered
                | Self::CapsuleTerminated
                | Self::GardenerOverride
                | Self::SystemHaltCommitted
                | Self::SystemShutdown
                | Self::InvariantViolation
        )
    }

    /// Parses a canonical wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_KINDS: &[EventKind] = &[
    EventKind::CapsuleGenesis,
    EventKind::SpawnAdmitted,
    EventKind::SpawnDenied,
    EventKind::SpawnRolledBack,
    EventKind::PulseRejected,
    EventKind::LivenessViolation,
    EventKind::LivenessFailure,
    EventKind::QuarantineEntered,
    EventKind::QuarantineRecovered,
    EventKind::CapsuleTerminated,
    EventKind::ReflexBlock,
    EventKind::IntuitionReject,
    EventKind::CoherenceReject,
    EventKind::ArbiterDeny,
    EventKind::DeliberationRefuse,
    EventKind::PipelineTimeout,
    EventKind::StressLevelChanged,
    EventKind::TetherUpdated,
    EventKind::BreakerTripped,
    EventKind::BreakerReset,
    EventKind::EscapeAttempt,
    EventKind::SandboxAdmitted,
    EventKind::SandboxEscalated,
    EventKind::SandboxReleased,
    EventKind::MessageDeadLetter,
    EventKind::PrecedentEstablished,
    EventKind::PrecedentRejected,
    EventKind::QuorumDecided,
    EventKind::TribunalVerdict,
    EventKind::SciRecomputed,
    EventKind::GardenerOverride,
    EventKind::SystemHaltCommitted,
    EventKind::SystemShutdown,
    EventKind::InvariantViolation,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for kind in ALL_KINDS {
            assert_eq!(EventKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(EventKind::parse("NOT_A_TAG"), None);
    }

    #[test]
    fn lifecycle_classification() {
        assert!(EventKind::CapsuleGenesis.is_lifecycle());
        assert!(EventKind::SystemHaltCommitted.is_lifecycle());
        assert!(!EventKind::ReflexBlock.is_lifecycle());
        assert!(!EventKind::SciRecomputed.is_lifecycle());
    }
}
