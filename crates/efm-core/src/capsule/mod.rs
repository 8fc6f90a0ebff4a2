//! Capsule identity, genesis, lifecycle, and health model.
//!
//! A capsule is an autonomous agent governed by the runtime. Its identity is
//! a stable id bound to an immutable [`GenesisRecord`] signed by its parent
//! (or the root authority for the root capsule). Lifecycle stage is derived
//! from age and health; status transitions are monotone except the
//! quarantine probation path.

mod health;

pub use health::{HealthVector, composite_health};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Tick;
use crate::crypto::{CanonicalWriter, ContentHash, ContentHasher, Signer, verify_signature};

/// Schema version stamped into every genesis record.
///
/// Persisted-state compatibility is keyed off this value.
pub const GENESIS_SCHEMA_VERSION: u32 = 1;

/// Age boundary below which a capsule is an Infant, in ticks.
pub const INFANT_AGE_TICKS: u64 = 100;

/// Age boundary below which a capsule is a Juvenile, in ticks.
pub const JUVENILE_AGE_TICKS: u64 = 1_000;

/// Composite health below which a capsule is Senescent.
pub const SENESCENT_HEALTH: f64 = 0.40;

/// Composite health below which a capsule is Terminal.
pub const TERMINAL_HEALTH: f64 = 0.20;

/// Stable identifier for a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapsuleId(Uuid);

impl CapsuleId {
    /// Generates a fresh random capsule id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for CapsuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CapsuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle stage of a capsule.
///
/// Stage is derived: age drives the early stages, composite health drives
/// the late ones. Terminated is a status, not a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    /// Genesis record registered, first pulse not yet accepted.
    Genesis,
    /// Age below [`INFANT_AGE_TICKS`].
    Infant,
    /// Age below [`JUVENILE_AGE_TICKS`].
    Juvenile,
    /// Full participant.
    Mature,
    /// Composite health below [`SENESCENT_HEALTH`].
    Senescent,
    /// Composite health below [`TERMINAL_HEALTH`].
    Terminal,
}

impl LifecycleStage {
    /// Derives the stage from age and composite health.
    #[must_use]
    pub fn derive(age_ticks: u64, health_composite: f64) -> Self {
        if health_composite < TERMINAL_HEALTH {
            Self::Terminal
        } else if health_composite < SENESCENT_HEALTH {
            Self::Senescent
        } else if age_ticks < INFANT_AGE_TICKS {
            Self::Infant
        } else if age_ticks < JUVENILE_AGE_TICKS {
            Self::Juvenile
        } else {
            Self::Mature
        }
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Genesis => "genesis",
            Self::Infant => "infant",
            Self::Juvenile => "juvenile",
            Self::Mature => "mature",
            Self::Senescent => "senescent",
            Self::Terminal => "terminal",
        };
        write!(f, "{name}")
    }
}

/// Runtime status of a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsuleStatus {
    /// Participating normally.
    Active,
    /// Operations suspended pending probation or disposition.
    Quarantined,
    /// Permanently terminated; no transition leaves this status.
    Terminated,
}

impl CapsuleStatus {
    /// Returns true if `next` is a legal transition from this status.
    ///
    /// Transitions are monotone except Quarantined back to Active, which
    /// requires probation completion (enforced by the liveness monitor).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Terminated, _) => false,
            (Self::Active, Self::Quarantined | Self::Terminated)
            | (Self::Quarantined, Self::Active | Self::Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CapsuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
            Self::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

/// Growth mode controlling how a capsule may extend itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GrowthMode {
    /// Unrestricted growth.
    #[default]
    Open,
    /// Observation only; proposals require review.
    Sensor,
    /// Growth suspended (critical stress or degraded health).
    Closed,
}

impl GrowthMode {
    /// Evaluates the growth mode for a capsule given the current stress
    /// state.
    ///
    /// Critical stress or degraded health closes growth; elevated stress
    /// drops to sensor mode.
    #[must_use]
    pub fn evaluate(stress_critical: bool, stress_elevated: bool, health_composite: f64) -> Self {
        if stress_critical || health_composite < SENESCENT_HEALTH {
            Self::Closed
        } else if stress_elevated || health_composite < 0.60 {
            Self::Sensor
        } else {
            Self::Open
        }
    }
}

/// The immutable origin record of a capsule.
///
/// Signed by the parent capsule (or the root authority key for the root)
/// and referenced by hash in the vault and in every pulse the capsule
/// emits. The hash is stable for the capsule's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisRecord {
    /// The capsule this record creates.
    pub capsule_id: CapsuleId,

    /// Parent capsule id; `None` for the root capsule.
    pub parent_id: Option<CapsuleId>,

    /// Logical tick of creation.
    pub creation_tick: Tick,

    /// Lineage depth; root is 0, every child is parent + 1.
    pub lineage_depth: u32,

    /// Hash of the task content that justified the spawn.
    pub task_hash: ContentHash,

    /// Hash of the commandment set in force at creation.
    pub commandment_hash: ContentHash,

    /// Record schema version.
    pub schema_version: u32,

    /// Parent (or root authority) signature over the canonical bytes.
    pub signature: Vec<u8>,
}

impl GenesisRecord {
    const SIGNING_DOMAIN: &'static str = "efm.genesis.v1";

    /// Builds and signs a genesis record.
    #[must_use]
    pub fn create(
        capsule_id: CapsuleId,
        parent_id: Option<CapsuleId>,
        creation_tick: Tick,
        lineage_depth: u32,
        task_hash: ContentHash,
        commandment_hash: ContentHash,
        signer: &Signer,
    ) -> Self {
        let mut record = Self {
            capsule_id,
            parent_id,
            creation_tick,
            lineage_depth,
            task_hash,
            commandment_hash,
            schema_version: GENESIS_SCHEMA_VERSION,
            signature: Vec::new(),
        };
        record.signature = signer.sign(&record.signing_bytes());
        record
    }

    /// Canonical bytes covered by the signature and the genesis hash.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new(Self::SIGNING_DOMAIN);
        w.put_str(&self.capsule_id.as_string());
        match &self.parent_id {
            Some(parent) => {
                let s = parent.as_string();
                w.put_opt_bytes(Some(s.as_bytes()));
            },
            None => {
                w.put_opt_bytes(None);
            },
        }
        w.put_u64(self.creation_tick.value());
        w.put_u64(u64::from(self.lineage_depth));
        w.put_bytes(self.task_hash.as_bytes());
        w.put_bytes(self.commandment_hash.as_bytes());
        w.put_u64(u64::from(self.schema_version));
        w.finish()
    }

    /// The stable genesis hash referenced by pulses and the vault.
    #[must_use]
    pub fn genesis_hash(&self) -> ContentHash {
        ContentHasher::hash(Self::SIGNING_DOMAIN, &self.signing_bytes())
    }

    /// Verifies the record's signature against a public key.
    #[must_use]
    pub fn verify(&self, public_key: &[u8]) -> bool {
        verify_signature(public_key, &self.signing_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis(signer: &Signer) -> GenesisRecord {
        GenesisRecord::create(
            CapsuleId::generate(),
            None,
            Tick::new(1),
            0,
            ContentHasher::hash("efm.task", b"root task"),
            ContentHasher::hash("efm.commandments", b"commandments"),
            signer,
        )
    }

    #[test]
    fn genesis_hash_is_stable() {
        let signer = Signer::generate();
        let record = genesis(&signer);
        assert_eq!(record.genesis_hash(), record.genesis_hash());
    }

    #[test]
    fn genesis_signature_verifies() {
        let signer = Signer::generate();
        let record = genesis(&signer);
        assert!(record.verify(&signer.public_key()));

        let other = Signer::generate();
        assert!(!record.verify(&other.public_key()));
    }

    #[test]
    fn genesis_serde_round_trip() {
        let signer = Signer::generate();
        let record = genesis(&signer);
        let json = serde_json::to_string(&record).unwrap();
        let decoded: GenesisRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, decoded);
        assert_eq!(record.genesis_hash(), decoded.genesis_hash());
    }

    #[test]
    fn stage_derivation_matches_boundaries() {
        assert_eq!(LifecycleStage::derive(0, 1.0), LifecycleStage::Infant);
        assert_eq!(LifecycleStage::derive(99, 1.0), LifecycleStage::Infant);
        assert_eq!(LifecycleStage::derive(100, 1.0), LifecycleStage::Juvenile);
        assert_eq!(LifecycleStage::derive(1_000, 1.0), LifecycleStage::Mature);
        assert_eq!(LifecycleStage::derive(1_000, 0.39), LifecycleStage::Senescent);
        assert_eq!(LifecycleStage::derive(1_000, 0.19), LifecycleStage::Terminal);
    }

    #[test]
    fn status_transitions_are_monotone() {
        use CapsuleStatus::{Active, Quarantined, Terminated};

        assert!(Active.can_transition_to(Quarantined));
        assert!(Active.can_transition_to(Terminated));
        assert!(Quarantined.can_transition_to(Active));
        assert!(Quarantined.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Quarantined));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn growth_mode_closes_under_critical_stress() {
        assert_eq!(GrowthMode::evaluate(true, true, 0.9), GrowthMode::Closed);
        assert_eq!(GrowthMode::evaluate(false, false, 0.3), GrowthMode::Closed);
        assert_eq!(GrowthMode::evaluate(false, true, 0.9), GrowthMode::Sensor);
        assert_eq!(GrowthMode::evaluate(false, false, 0.9), GrowthMode::Open);
    }
}
