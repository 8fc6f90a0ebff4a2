//! Four-level sandbox enforcement.
//!
//! A sandbox session restricts a capsule jointly at three edges:
//! capability tokens on state-mutating operations, the message interceptor
//! at the outbound bus edge, and the resource partition at admission. No
//! write from a sandboxed capsule reaches state outside its session.
//!
//! Levels, strictly increasing isolation:
//!
//! - **L1 Observation**: full effects, interception is log-only
//! - **L2 Restricted**: spawn / coherence broadcast / precedent writes
//!   revoked, swarm traffic blocked, resource partition halved
//! - **L3 Isolated**: external comms and resource requests also revoked,
//!   all traffic blocked, I/O answered by a deterministic simulator
//! - **L4 Forensic**: every capability revoked, stepwise execution with a
//!   per-operation analysis record
//!
//! Three violations in a session, or one critical violation, escalate to
//! L4; violations at L4 require a termination disposition.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditChain, AuditError, AuditEvent, AuditWriter, EventKind};
use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::{ContentHash, ContentHasher};

/// Sandbox isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SandboxLevel {
    /// L1: observation.
    Observation,
    /// L2: restricted.
    Restricted,
    /// L3: isolated.
    Isolated,
    /// L4: forensic.
    Forensic,
}

impl SandboxLevel {
    /// Numeric level (1 through 4).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Observation => 1,
            Self::Restricted => 2,
            Self::Isolated => 3,
            Self::Forensic => 4,
        }
    }

    /// Capabilities revoked at this level.
    #[must_use]
    pub const fn revoked(self) -> CapabilitySet {
        match self {
            Self::Observation => CapabilitySet::NONE,
            Self::Restricted => CapabilitySet::NONE
                .with(Capability::Spawn)
                .with(Capability::BroadcastCoherence)
                .with(Capability::PrecedentWrite),
            Self::Isolated => Self::Restricted
                .revoked()
                .with(Capability::ExternalComm)
                .with(Capability::ResourceRequest),
            Self::Forensic => CapabilitySet::ALL,
        }
    }

    /// Message interception mode at this level.
    #[must_use]
    pub const fn intercept_mode(self) -> InterceptMode {
        match self {
            Self::Observation => InterceptMode::LogOnly,
            Self::Restricted => InterceptMode::BlockSwarm,
            Self::Isolated | Self::Forensic => InterceptMode::BlockAll,
        }
    }

    /// Fraction of the nominal resource partition granted.
    #[must_use]
    pub const fn partition_factor(self) -> f64 {
        match self {
            Self::Observation => 1.0,
            Self::Restricted => 0.5,
            Self::Isolated => 0.25,
            Self::Forensic => 0.1,
        }
    }

    /// The next-lower level, if any.
    #[must_use]
    pub const fn demoted(self) -> Option<Self> {
        match self {
            Self::Observation => None,
            Self::Restricted => Some(Self::Observation),
            Self::Isolated => Some(Self::Restricted),
            Self::Forensic => None,
        }
    }
}

impl std::fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// A capability a sandbox may revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Spawning children.
    Spawn,
    /// Broadcasting coherence updates to the swarm.
    BroadcastCoherence,
    /// Writing precedents.
    PrecedentWrite,
    /// Communicating outside the swarm.
    ExternalComm,
    /// Requesting resource allocation.
    ResourceRequest,
    /// Mutating shared state.
    StateWrite,
}

impl Capability {
    const ALL: [Self; 6] = [
        Self::Spawn,
        Self::BroadcastCoherence,
        Self::PrecedentWrite,
        Self::ExternalComm,
        Self::ResourceRequest,
        Self::StateWrite,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::Spawn => 1,
            Self::BroadcastCoherence => 1 << 1,
            Self::PrecedentWrite => 1 << 2,
            Self::ExternalComm => 1 << 3,
            Self::ResourceRequest => 1 << 4,
            Self::StateWrite => 1 << 5,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spawn => "Spawn",
            Self::BroadcastCoherence => "BroadcastCoherence",
            Self::PrecedentWrite => "PrecedentWrite",
            Self::ExternalComm => "ExternalComm",
            Self::ResourceRequest => "ResourceRequest",
            Self::StateWrite => "StateWrite",
        };
        f.write_str(name)
    }
}

/// A compact capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// The empty set.
    pub const NONE: Self = Self(0);

    /// Every capability.
    pub const ALL: Self = Self(0b11_1111);

    /// Returns the set with `capability` added.
    #[must_use]
    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Returns true if the set contains `capability`.
    #[must_use]
    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// The capabilities in the set.
    #[must_use]
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

/// What the outbound interceptor does with a sandboxed capsule's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptMode {
    /// Forward and log.
    LogOnly,
    /// Block traffic addressed to the swarm; log the rest.
    BlockSwarm,
    /// Block all outbound traffic.
    BlockAll,
}

/// Severity class of a sandbox violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Ordinary violation; escalation after the configured count.
    Standard,
    /// Critical violation; escalates immediately.
    Critical,
}

/// What a violation triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Violation recorded, session level unchanged.
    None,
    /// The session escalated to L4 forensic.
    EscalatedToForensic,
    /// The session was already at L4; termination is required.
    TerminationRequired,
}

/// Final disposition of an L4 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Release into medical treatment (health remediation).
    Treatment,
    /// Terminate the capsule.
    Termination,
}

/// A live sandbox session.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    /// The sandboxed capsule.
    pub capsule_id: CapsuleId,

    /// Current level.
    pub level: SandboxLevel,

    /// Tick of entry to the current level.
    pub entry_tick: Tick,

    /// Capabilities revoked (derived from the level).
    pub revoked: CapabilitySet,

    /// Interception mode (derived from the level).
    pub intercept: InterceptMode,

    /// Resource partition factor (derived from the level).
    pub partition_factor: f64,

    /// Violations recorded in this session.
    pub violation_count: u32,
}

impl SandboxSession {
    fn new(capsule_id: CapsuleId, level: SandboxLevel, entry_tick: Tick) -> Self {
        Self {
            capsule_id,
            level,
            entry_tick,
            revoked: level.revoked(),
            intercept: level.intercept_mode(),
            partition_factor: level.partition_factor(),
            violation_count: 0,
        }
    }

    fn move_to(&mut self, level: SandboxLevel, tick: Tick) {
        self.level = level;
        self.entry_tick = tick;
        self.revoked = level.revoked();
        self.intercept = level.intercept_mode();
        self.partition_factor = level.partition_factor();
    }
}

/// Sandbox configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Violations that escalate a session to L4.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Whether one critical violation escalates immediately.
    #[serde(default = "default_auto_escalate")]
    pub auto_escalate_on_critical: bool,

    /// Clean ticks after which an L1 session clears.
    #[serde(default = "default_l1_duration")]
    pub observation_duration_ticks: u64,

    /// Clean ticks after which L2/L3 sessions demote one level.
    #[serde(default = "default_clean_interval")]
    pub clean_interval_ticks: u64,
}

const fn default_violation_threshold() -> u32 {
    3
}

const fn default_auto_escalate() -> bool {
    true
}

const fn default_l1_duration() -> u64 {
    200
}

const fn default_clean_interval() -> u64 {
    500
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            auto_escalate_on_critical: default_auto_escalate(),
            observation_duration_ticks: default_l1_duration(),
            clean_interval_ticks: default_clean_interval(),
        }
    }
}

/// Errors from sandbox enforcement.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The capability is revoked in the current session.
    #[error("capability revoked: {capability} (session {level})")]
    CapabilityRevoked {
        /// The revoked capability.
        capability: Capability,
        /// The session level.
        level: SandboxLevel,
    },

    /// A write attempted to escape the session boundary.
    #[error("sandbox escape attempt by {capsule_id}")]
    SandboxEscape {
        /// The offending capsule.
        capsule_id: CapsuleId,
    },

    /// No session exists for the capsule.
    #[error("capsule is not sandboxed: {capsule_id}")]
    NotSandboxed {
        /// The capsule.
        capsule_id: CapsuleId,
    },

    /// Audit append failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// The sandbox enforcer.
pub struct SandboxEnforcer {
    chain: Arc<AuditChain>,
    config: SandboxConfig,
    sessions: Mutex<HashMap<CapsuleId, SandboxSession>>,
}

impl SandboxEnforcer {
    /// Creates an enforcer.
    #[must_use]
    pub fn new(chain: Arc<AuditChain>, config: SandboxConfig) -> Self {
        Self {
            chain,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a capsule to a sandbox session at `level`.
    ///
    /// Re-admitting an already-sandboxed capsule moves its session to the
    /// stricter of the two levels.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit append fails.
    pub fn admit(
        &self,
        capsule_id: CapsuleId,
        level: SandboxLevel,
        now: Tick,
    ) -> Result<SandboxSession, SandboxError> {
        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .entry(capsule_id)
                .and_modify(|s| {
                    if level > s.level {
                        s.move_to(level, now);
                    }
                })
                .or_insert_with(|| SandboxSession::new(capsule_id, level, now));
            session.clone()
        };

        info!(capsule = %capsule_id, level = %session.level, "sandbox session admitted");
        self.chain.append(AuditEvent::new(
            EventKind::SandboxAdmitted,
            now,
            AuditWriter::system("sandbox"),
            Some(capsule_id),
            &json!({ "level": session.level.number() }),
        ))?;
        Ok(session)
    }

    /// The current session for a capsule, if any.
    #[must_use]
    pub fn session(&self, capsule_id: CapsuleId) -> Option<SandboxSession> {
        self.sessions.lock().unwrap().get(&capsule_id).cloned()
    }

    /// Checks a state-mutating operation against the capsule's session.
    ///
    /// Unsandboxed capsules pass. A revoked capability records a violation,
    /// may escalate the session, and fails with
    /// [`SandboxError::CapabilityRevoked`].
    ///
    /// # Errors
    ///
    /// - [`SandboxError::CapabilityRevoked`] when the operation is revoked.
    /// - [`SandboxError::Audit`] if violation logging fails.
    pub fn check_operation(
        &self,
        capsule_id: CapsuleId,
        capability: Capability,
        now: Tick,
    ) -> Result<(), SandboxError> {
        let revoked_in = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&capsule_id)
                .filter(|s| s.revoked.contains(capability))
                .map(|s| s.level)
        };

        let Some(level) = revoked_in else {
            return Ok(());
        };

        self.record_violation(
            capsule_id,
            ViolationSeverity::Standard,
            &format!("revoked capability invoked: {capability}"),
            now,
        )?;

        Err(SandboxError::CapabilityRevoked { capability, level })
    }

    /// Records a violation and applies the escalation policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit append fails; unknown capsules get
    /// [`SandboxError::NotSandboxed`].
    pub fn record_violation(
        &self,
        capsule_id: CapsuleId,
        severity: ViolationSeverity,
        detail: &str,
        now: Tick,
    ) -> Result<EscalationAction, SandboxError> {
        let (count, action) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&capsule_id)
                .ok_or(SandboxError::NotSandboxed { capsule_id })?;

            session.violation_count += 1;
            let critical =
                severity == ViolationSeverity::Critical && self.config.auto_escalate_on_critical;
            let over_threshold = session.violation_count >= self.config.violation_threshold;

            let action = if critical || over_threshold {
                if session.level == SandboxLevel::Forensic {
                    EscalationAction::TerminationRequired
                } else {
                    session.move_to(SandboxLevel::Forensic, now);
                    EscalationAction::EscalatedToForensic
                }
            } else {
                EscalationAction::None
            };
            (session.violation_count, action)
        };

        warn!(capsule = %capsule_id, count, ?severity, "sandbox violation");
        self.chain.append(AuditEvent::new(
            EventKind::EscapeAttempt,
            now,
            AuditWriter::system("sandbox"),
            Some(capsule_id),
            &json!({
                "severity": match severity {
                    ViolationSeverity::Standard => "standard",
                    ViolationSeverity::Critical => "critical",
                },
                "detail": detail,
                "violation_count": count,
            }),
        ))?;

        match action {
            EscalationAction::EscalatedToForensic => {
                self.chain.append(AuditEvent::new(
                    EventKind::SandboxEscalated,
                    now,
                    AuditWriter::system("sandbox"),
                    Some(capsule_id),
                    &json!({ "to_level": 4, "violation_count": count }),
                ))?;
            },
            EscalationAction::TerminationRequired => {
                self.chain.append(AuditEvent::new(
                    EventKind::SandboxEscalated,
                    now,
                    AuditWriter::system("sandbox"),
                    Some(capsule_id),
                    &json!({ "to_level": 4, "termination_required": true }),
                ))?;
            },
            EscalationAction::None => {},
        }

        Ok(action)
    }

    /// Decides what to do with an outbound message at the bus edge.
    ///
    /// Returns true if the message may be forwarded. `swarm_bound` is true
    /// for messages addressed inside the swarm (unicast to a capsule or
    /// broadcast).
    #[must_use]
    pub fn allow_outbound(&self, capsule_id: CapsuleId, swarm_bound: bool) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&capsule_id).map(|s| s.intercept) {
            None | Some(InterceptMode::LogOnly) => true,
            Some(InterceptMode::BlockSwarm) => !swarm_bound,
            Some(InterceptMode::BlockAll) => false,
        }
    }

    /// Answers an I/O request for an L3/L4 session deterministically.
    ///
    /// The simulated response is a pure function of the request bytes, so
    /// replays inside the session observe identical effects and nothing
    /// leaks outside.
    #[must_use]
    pub fn simulate_io(&self, capsule_id: CapsuleId, request: &[u8]) -> ContentHash {
        let mut domain = String::from("efm.sandbox.sim.v1:");
        domain.push_str(&capsule_id.as_string());
        ContentHasher::hash(&domain, request)
    }

    /// Applies the per-level exit rules at tick `now`.
    ///
    /// L1 sessions with no violations clear after their configured
    /// duration; clean L2/L3 sessions demote one level after the clean
    /// interval. L4 sessions only exit through
    /// [`SandboxEnforcer::release_with_disposition`].
    ///
    /// # Errors
    ///
    /// Returns an error if an audit append fails.
    pub fn apply_exit_rules(&self, now: Tick) -> Result<Vec<CapsuleId>, SandboxError> {
        let mut released = Vec::new();
        let transitions = {
            let mut sessions = self.sessions.lock().unwrap();
            let mut transitions = Vec::new();
            let ids: Vec<CapsuleId> = sessions.keys().copied().collect();
            for id in ids {
                let session = sessions.get_mut(&id).expect("id was just listed");
                if session.violation_count > 0 {
                    continue;
                }
                let elapsed = now.since(session.entry_tick);
                match session.level {
                    SandboxLevel::Observation => {
                        if elapsed >= self.config.observation_duration_ticks {
                            sessions.remove(&id);
                            transitions.push((id, None));
                        }
                    },
                    SandboxLevel::Restricted | SandboxLevel::Isolated => {
                        if elapsed >= self.config.clean_interval_ticks {
                            let lower = session.level.demoted().expect("L2/L3 demote");
                            session.move_to(lower, now);
                            transitions.push((id, Some(lower)));
                        }
                    },
                    SandboxLevel::Forensic => {},
                }
            }
            transitions
        };

        for (id, to) in transitions {
            match to {
                None => {
                    self.chain.append(AuditEvent::new(
                        EventKind::SandboxReleased,
                        now,
                        AuditWriter::system("sandbox"),
                        Some(id),
                        &json!({ "reason": "clean_observation" }),
                    ))?;
                    released.push(id);
                },
                Some(level) => {
                    self.chain.append(AuditEvent::new(
                        EventKind::SandboxReleased,
                        now,
                        AuditWriter::system("sandbox"),
                        Some(id),
                        &json!({ "demoted_to": level.number() }),
                    ))?;
                },
            }
        }
        Ok(released)
    }

    /// Releases an L4 session with a diagnosed disposition.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::NotSandboxed`] if no session exists.
    /// - [`SandboxError::Audit`] if the audit append fails.
    pub fn release_with_disposition(
        &self,
        capsule_id: CapsuleId,
        disposition: Disposition,
        now: Tick,
    ) -> Result<(), SandboxError> {
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .remove(&capsule_id)
                .ok_or(SandboxError::NotSandboxed { capsule_id })?;
        }

        self.chain.append(AuditEvent::new(
            EventKind::SandboxReleased,
            now,
            AuditWriter::system("sandbox"),
            Some(capsule_id),
            &json!({
                "disposition": match disposition {
                    Disposition::Treatment => "treatment",
                    Disposition::Termination => "termination",
                },
            }),
        ))?;
        Ok(())
    }

    /// Releases a session unconditionally (operator action).
    ///
    /// With no recorded operations this restores the capsule to its prior
    /// capability set, because capabilities are only restricted while a
    /// session exists.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::NotSandboxed`] if no session exists.
    /// - [`SandboxError::Audit`] if the audit append fails.
    pub fn release(&self, capsule_id: CapsuleId, now: Tick) -> Result<(), SandboxError> {
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .remove(&capsule_id)
                .ok_or(SandboxError::NotSandboxed { capsule_id })?;
        }
        self.chain.append(AuditEvent::new(
            EventKind::SandboxReleased,
            now,
            AuditWriter::system("sandbox"),
            Some(capsule_id),
            &json!({ "reason": "released" }),
        ))?;
        Ok(())
    }
}

impl std::fmt::Debug for SandboxEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnforcer")
            .field("sessions", &self.sessions.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditBackend;

    fn enforcer() -> (Arc<AuditChain>, SandboxEnforcer) {
        let chain = Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap());
        let enforcer = SandboxEnforcer::new(chain.clone(), SandboxConfig::default());
        (chain, enforcer)
    }

    #[test]
    fn levels_strictly_increase_isolation() {
        assert_eq!(SandboxLevel::Observation.revoked(), CapabilitySet::NONE);
        assert!(SandboxLevel::Restricted.revoked().contains(Capability::Spawn));
        assert!(!SandboxLevel::Restricted.revoked().contains(Capability::ExternalComm));
        assert!(SandboxLevel::Isolated.revoked().contains(Capability::ExternalComm));
        assert_eq!(SandboxLevel::Forensic.revoked(), CapabilitySet::ALL);

        assert!(SandboxLevel::Observation.partition_factor() > SandboxLevel::Restricted.partition_factor());
        assert!(SandboxLevel::Restricted.partition_factor() > SandboxLevel::Isolated.partition_factor());
    }

    #[test]
    fn unsandboxed_operations_pass() {
        let (_chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        assert!(enforcer.check_operation(id, Capability::Spawn, Tick::new(1)).is_ok());
    }

    #[test]
    fn l3_spawn_fails_with_capability_revoked() {
        let (chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        enforcer.admit(id, SandboxLevel::Isolated, Tick::new(1)).unwrap();

        let result = enforcer.check_operation(id, Capability::Spawn, Tick::new(2));
        assert!(matches!(
            result,
            Err(SandboxError::CapabilityRevoked {
                capability: Capability::Spawn,
                ..
            })
        ));
        assert_eq!(enforcer.session(id).unwrap().violation_count, 1);
        assert_eq!(chain.query_kind(EventKind::EscapeAttempt, 10).unwrap().len(), 1);
    }

    #[test]
    fn three_violations_escalate_to_forensic() {
        let (chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        enforcer.admit(id, SandboxLevel::Isolated, Tick::new(1)).unwrap();

        for tick in 2..=4 {
            let _ = enforcer.check_operation(id, Capability::Spawn, Tick::new(tick));
        }

        let session = enforcer.session(id).unwrap();
        assert_eq!(session.level, SandboxLevel::Forensic);
        assert_eq!(session.violation_count, 3);
        assert_eq!(chain.query_kind(EventKind::SandboxEscalated, 10).unwrap().len(), 1);
    }

    #[test]
    fn critical_violation_escalates_immediately() {
        let (_chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        enforcer.admit(id, SandboxLevel::Restricted, Tick::new(1)).unwrap();

        let action = enforcer
            .record_violation(id, ViolationSeverity::Critical, "wrote outside session", Tick::new(2))
            .unwrap();
        assert_eq!(action, EscalationAction::EscalatedToForensic);
        assert_eq!(enforcer.session(id).unwrap().level, SandboxLevel::Forensic);
    }

    #[test]
    fn violation_at_forensic_requires_termination() {
        let (_chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        enforcer.admit(id, SandboxLevel::Forensic, Tick::new(1)).unwrap();

        let action = enforcer
            .record_violation(id, ViolationSeverity::Critical, "escape", Tick::new(2))
            .unwrap();
        assert_eq!(action, EscalationAction::TerminationRequired);
    }

    #[test]
    fn interceptor_modes_gate_outbound_traffic() {
        let (_chain, enforcer) = enforcer();
        let observed = CapsuleId::generate();
        let restricted = CapsuleId::generate();
        let isolated = CapsuleId::generate();
        enforcer.admit(observed, SandboxLevel::Observation, Tick::new(1)).unwrap();
        enforcer.admit(restricted, SandboxLevel::Restricted, Tick::new(1)).unwrap();
        enforcer.admit(isolated, SandboxLevel::Isolated, Tick::new(1)).unwrap();

        assert!(enforcer.allow_outbound(observed, true));
        assert!(!enforcer.allow_outbound(restricted, true));
        assert!(enforcer.allow_outbound(restricted, false));
        assert!(!enforcer.allow_outbound(isolated, true));
        assert!(!enforcer.allow_outbound(isolated, false));
        assert!(enforcer.allow_outbound(CapsuleId::generate(), true));
    }

    #[test]
    fn simulated_io_is_deterministic_and_session_scoped() {
        let (_chain, enforcer) = enforcer();
        let a = CapsuleId::generate();
        let b = CapsuleId::generate();

        assert_eq!(enforcer.simulate_io(a, b"read /x"), enforcer.simulate_io(a, b"read /x"));
        assert_ne!(enforcer.simulate_io(a, b"read /x"), enforcer.simulate_io(b, b"read /x"));
        assert_ne!(enforcer.simulate_io(a, b"read /x"), enforcer.simulate_io(a, b"read /y"));
    }

    #[test]
    fn admit_then_release_restores_capabilities() {
        let (_chain, enforcer) = enforcer();
        let id = CapsuleId::generate();

        enforcer.admit(id, SandboxLevel::Isolated, Tick::new(1)).unwrap();
        assert!(enforcer.check_operation(id, Capability::ExternalComm, Tick::new(2)).is_err());

        enforcer.release(id, Tick::new(3)).unwrap();
        assert!(enforcer.session(id).is_none());
        assert!(enforcer.check_operation(id, Capability::ExternalComm, Tick::new(4)).is_ok());
    }

    #[test]
    fn clean_l1_clears_and_clean_l3_demotes() {
        let (_chain, enforcer) = enforcer();
        let l1 = CapsuleId::generate();
        let l3 = CapsuleId::generate();
        enforcer.admit(l1, SandboxLevel::Observation, Tick::new(0)).unwrap();
        enforcer.admit(l3, SandboxLevel::Isolated, Tick::new(0)).unwrap();

        let released = enforcer.apply_exit_rules(Tick::new(500)).unwrap();
        assert_eq!(released, vec![l1]);
        assert!(enforcer.session(l1).is_none());
        assert_eq!(enforcer.session(l3).unwrap().level, SandboxLevel::Restricted);
    }

    #[test]
    fn forensic_only_exits_via_disposition() {
        let (_chain, enforcer) = enforcer();
        let id = CapsuleId::generate();
        enforcer.admit(id, SandboxLevel::Forensic, Tick::new(0)).unwrap();

        enforcer.apply_exit_rules(Tick::new(10_000)).unwrap();
        assert!(enforcer.session(id).is_some());

        enforcer
            .release_with_disposition(id, Disposition::Treatment, Tick::new(10_001))
            .unwrap();
        assert!(enforcer.session(id).is_none());
    }
}
