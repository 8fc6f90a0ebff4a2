//! Spawn admission (conditions S1 through S6) and first-pulse rollback.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditChain, AuditError, AuditEvent, AuditWriter, EventKind};
use crate::capsule::{CapsuleId, CapsuleStatus, GenesisRecord};
use crate::clock::Tick;
use crate::crypto::{ContentHasher, Keyring, KeyringError};
use crate::governor::{PriorityTier, ResourceGovernor};
use crate::registry::{CapsuleRegistry, CapsuleSlot, RegistryError};
use crate::stress::StressLevel;
use crate::tether::TetherVector;
use crate::vault::{Vault, VaultError};

/// Swarm-wide spawn caps per admission window, by stress level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnLimits {
    /// Cap at low stress.
    #[serde(default = "default_limit_low")]
    pub low: u32,

    /// Cap at medium stress.
    #[serde(default = "default_limit_medium")]
    pub medium: u32,

    /// Cap at high stress.
    #[serde(default = "default_limit_high")]
    pub high: u32,

    /// Cap at critical stress.
    #[serde(default = "default_limit_critical")]
    pub critical: u32,
}

const fn default_limit_low() -> u32 {
    8
}

const fn default_limit_medium() -> u32 {
    4
}

const fn default_limit_high() -> u32 {
    1
}

const fn default_limit_critical() -> u32 {
    0
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            low: default_limit_low(),
            medium: default_limit_medium(),
            high: default_limit_high(),
            critical: default_limit_critical(),
        }
    }
}

impl SpawnLimits {
    /// The cap for a stress level.
    #[must_use]
    pub const fn for_level(&self, level: StressLevel) -> u32 {
        match level {
            StressLevel::Low => self.low,
            StressLevel::Medium => self.medium,
            StressLevel::High => self.high,
            StressLevel::Critical => self.critical,
        }
    }
}

/// Spawn governance configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Swarm-wide per-window spawn caps by stress level.
    #[serde(default)]
    pub limits: SpawnLimits,

    /// Length of the spawn admission window, in ticks.
    #[serde(default = "default_limit_window")]
    pub limit_window_ticks: u64,

    /// Maximum lineage depth; a parent at `max_depth - 1` is the last that
    /// may spawn.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Minimum parent composite health (S2).
    #[serde(default = "default_min_parent_health")]
    pub min_parent_health: f64,

    /// Minimum swarm coherence index (S5).
    #[serde(default = "default_min_sci")]
    pub min_sci: f64,

    /// Ticks a registered child has to emit its first pulse before
    /// rollback.
    #[serde(default = "default_first_pulse_window")]
    pub first_pulse_window_ticks: u64,
}

const fn default_limit_window() -> u64 {
    100
}

const fn default_max_depth() -> u32 {
    10
}

const fn default_min_parent_health() -> f64 {
    0.65
}

const fn default_min_sci() -> f64 {
    0.70
}

const fn default_first_pulse_window() -> u64 {
    10
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            limits: SpawnLimits::default(),
            limit_window_ticks: default_limit_window(),
            max_depth: default_max_depth(),
            min_parent_health: default_min_parent_health(),
            min_sci: default_min_sci(),
            first_pulse_window_ticks: default_first_pulse_window(),
        }
    }
}

/// The spawn condition that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnCondition {
    /// S1: task justification present.
    S1Justification,
    /// S2: parent health at or above the floor.
    S2ParentHealth,
    /// S3: resource governor admits.
    S3Resources,
    /// S4: lineage depth within bounds.
    S4Depth,
    /// S5: swarm coherence at or above the floor.
    S5Coherence,
    /// S6: genesis constructible and parent-signed.
    S6Genesis,
}

impl SpawnCondition {
    /// Canonical tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::S1Justification => "S1_JUSTIFICATION",
            Self::S2ParentHealth => "S2_HEALTH",
            Self::S3Resources => "S3_NO_RESOURCES",
            Self::S4Depth => "S4_DEPTH",
            Self::S5Coherence => "S5_COHERENCE",
            Self::S6Genesis => "S6_GENESIS",
        }
    }
}

impl std::fmt::Display for SpawnCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a spawn admission. A value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    /// All six conditions held; the child is registered.
    Admitted {
        /// The new capsule.
        child_id: CapsuleId,
        /// The child's genesis hash.
        genesis_hash: crate::crypto::ContentHash,
        /// Tick before which the child must emit its first pulse.
        first_pulse_deadline: Tick,
    },
    /// An admission condition failed.
    Denied {
        /// The failed condition.
        condition: SpawnCondition,
        /// Human-readable detail.
        detail: String,
    },
}

/// Infrastructure errors during spawn processing.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Vault failure.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Key custody failure.
    #[error(transparent)]
    Keys(#[from] KeyringError),

    /// Audit append failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// A spawn request from a parent capsule.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// The requesting parent.
    pub parent_id: CapsuleId,

    /// Task justification text (S1).
    pub justification: String,

    /// Priority tier for the child.
    pub tier: PriorityTier,
}

struct PendingChild {
    id: CapsuleId,
    deadline: Tick,
}

struct AdmissionWindow {
    opened: Tick,
    admitted: u32,
}

/// The spawn governor.
///
/// Admission evaluates S1 through S6 in order; all six must hold. On
/// admission the child is registered in the vault before it may pulse, and
/// rolled back (tombstone plus logged reversal) if its first pulse does not
/// arrive inside the configured window. Admissions are cancellable up to
/// vault registration simply by not completing the call; after
/// registration, rollback is the only reversal.
pub struct SpawnGovernor {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    governor: Arc<ResourceGovernor>,
    keys: Arc<Keyring>,
    chain: Arc<AuditChain>,
    config: SpawnConfig,
    pending: Mutex<Vec<PendingChild>>,
    window: Mutex<AdmissionWindow>,
}

impl SpawnGovernor {
    /// Creates a spawn governor.
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        registry: Arc<CapsuleRegistry>,
        governor: Arc<ResourceGovernor>,
        keys: Arc<Keyring>,
        chain: Arc<AuditChain>,
        config: SpawnConfig,
    ) -> Self {
        Self {
            vault,
            registry,
            governor,
            keys,
            chain,
            config,
            pending: Mutex::new(Vec::new()),
            window: Mutex::new(AdmissionWindow {
                opened: Tick::ZERO,
                admitted: 0,
            }),
        }
    }

    // The swarm-wide cap for the current stress level, over a rolling
    // admission window.
    fn window_has_room(&self, now: Tick, level: StressLevel) -> bool {
        let mut window = self.window.lock().unwrap();
        if now.since(window.opened) >= self.config.limit_window_ticks {
            window.opened = now;
            window.admitted = 0;
        }
        window.admitted < self.config.limits.for_level(level)
    }

    fn window_record_admission(&self) {
        self.window.lock().unwrap().admitted += 1;
    }

    /// Evaluates spawn admission for a request.
    ///
    /// `stress_level` and `sci` are the snapshot values at admission time;
    /// `tether` is the vector published for the current level.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; denials are
    /// values.
    #[allow(clippy::missing_panics_doc)]
    pub fn admit(
        &self,
        request: &SpawnRequest,
        now: Tick,
        stress_level: StressLevel,
        sci: f64,
        tether: TetherVector,
    ) -> Result<SpawnOutcome, SpawnError> {
        if let Some((condition, detail)) = self.check_conditions(request, now, stress_level, sci)? {
            warn!(parent = %request.parent_id, %condition, "spawn denied");
            self.chain.append(AuditEvent::new(
                EventKind::SpawnDenied,
                now,
                AuditWriter::system("spawn"),
                Some(request.parent_id),
                &json!({ "condition": condition.as_str(), "detail": detail }),
            ))?;
            return Ok(SpawnOutcome::Denied { condition, detail });
        }

        // S6: construct the parent-signed genesis and register it. The
        // parent's signing key must be on file; a missing key is an S6
        // denial, not an infrastructure error.
        let parent_signer = match self.keys.signer(&request.parent_id.as_string()) {
            Ok(signer) => signer,
            Err(KeyringError::UnknownKey { .. }) => {
                let detail = "parent signing key not on file".to_string();
                self.chain.append(AuditEvent::new(
                    EventKind::SpawnDenied,
                    now,
                    AuditWriter::system("spawn"),
                    Some(request.parent_id),
                    &json!({ "condition": SpawnCondition::S6Genesis.as_str(), "detail": detail }),
                ))?;
                return Ok(SpawnOutcome::Denied {
                    condition: SpawnCondition::S6Genesis,
                    detail,
                });
            },
            Err(e) => return Err(e.into()),
        };

        let parent_depth = self
            .registry
            .with_slot(request.parent_id, |slot| slot.lineage_depth)?;

        let child_id = CapsuleId::generate();
        let child_signer = self.keys.issue(&child_id.as_string())?;

        let genesis = GenesisRecord::create(
            child_id,
            Some(request.parent_id),
            now,
            parent_depth + 1,
            ContentHasher::hash("efm.task.v1", request.justification.as_bytes()),
            self.vault.commandment_hash(),
            &parent_signer,
        );

        let genesis_hash = self
            .vault
            .register(genesis, child_signer.public_key())?;

        self.registry.insert(CapsuleSlot::new(
            child_id,
            Some(request.parent_id),
            parent_depth + 1,
            genesis_hash,
            now,
            request.tier,
            tether,
        ))?;

        self.window_record_admission();

        let deadline = now.plus(self.config.first_pulse_window_ticks);
        self.pending.lock().unwrap().push(PendingChild {
            id: child_id,
            deadline,
        });

        info!(parent = %request.parent_id, child = %child_id, "spawn admitted");
        self.chain.append(AuditEvent::new(
            EventKind::SpawnAdmitted,
            now,
            AuditWriter::system("spawn"),
            Some(request.parent_id),
            &json!({ "child_id": child_id.as_string() }),
        ))?;
        self.chain.append(AuditEvent::new(
            EventKind::CapsuleGenesis,
            now,
            AuditWriter::system("spawn"),
            Some(child_id),
            &json!({
                "parent_id": request.parent_id.as_string(),
                "lineage_depth": parent_depth + 1,
                "genesis_hash": genesis_hash.to_string(),
            }),
        ))?;

        Ok(SpawnOutcome::Admitted {
            child_id,
            genesis_hash,
            first_pulse_deadline: deadline,
        })
    }

    fn check_conditions(
        &self,
        request: &SpawnRequest,
        now: Tick,
        stress_level: StressLevel,
        sci: f64,
    ) -> Result<Option<(SpawnCondition, String)>, SpawnError> {
        // S1: task justification present.
        if request.justification.trim().is_empty() {
            return Ok(Some((
                SpawnCondition::S1Justification,
                "empty task justification".to_string(),
            )));
        }

        // S2: parent health.
        let (parent_health, parent_depth, parent_status) =
            self.registry.with_slot(request.parent_id, |slot| {
                (slot.health.composite(), slot.lineage_depth, slot.status)
            })?;
        if parent_status != CapsuleStatus::Active {
            return Ok(Some((
                SpawnCondition::S2ParentHealth,
                format!("parent is {parent_status}"),
            )));
        }
        if parent_health < self.config.min_parent_health {
            return Ok(Some((
                SpawnCondition::S2ParentHealth,
                format!(
                    "parent health {parent_health:.2} below {:.2}",
                    self.config.min_parent_health
                ),
            )));
        }

        // S3: resource governor admits and the swarm-wide window has room.
        if let Err(e) = self
            .governor
            .admit_spawn(request.tier, stress_level, parent_health)
        {
            return Ok(Some((SpawnCondition::S3Resources, e.to_string())));
        }
        if !self.window_has_room(now, stress_level) {
            return Ok(Some((
                SpawnCondition::S3Resources,
                format!(
                    "spawn window cap {} reached for {stress_level} stress",
                    self.config.limits.for_level(stress_level)
                ),
            )));
        }

        // S4: lineage depth within bounds.
        if parent_depth + 1 >= self.config.max_depth {
            return Ok(Some((
                SpawnCondition::S4Depth,
                format!("child depth {} reaches limit {}", parent_depth + 1, self.config.max_depth),
            )));
        }

        // S5: swarm coherence.
        if sci < self.config.min_sci {
            return Ok(Some((
                SpawnCondition::S5Coherence,
                format!("sci {sci:.2} below {:.2}", self.config.min_sci),
            )));
        }

        Ok(None)
    }

    /// Rolls back registered children whose first pulse did not arrive by
    /// their deadline.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures.
    #[allow(clippy::missing_panics_doc)]
    pub fn check_first_pulses(&self, now: Tick) -> Result<Vec<CapsuleId>, SpawnError> {
        let due: Vec<PendingChild> = {
            let mut pending = self.pending.lock().unwrap();
            let mut still_waiting = Vec::new();
            let mut due = Vec::new();
            for child in pending.drain(..) {
                if now >= child.deadline {
                    due.push(child);
                } else {
                    still_waiting.push(child);
                }
            }
            *pending = still_waiting;
            due
        };

        let mut rolled_back = Vec::new();
        for child in due {
            let pulsed = self
                .registry
                .with_slot(child.id, |slot| slot.last_accepted_tick > slot.created_tick)?;
            if pulsed {
                continue;
            }

            self.registry
                .with_slot(child.id, |slot| slot.status = CapsuleStatus::Terminated)?;
            match self.vault.mark_terminated(child.id, "FIRST_PULSE_TIMEOUT", now) {
                Ok(()) | Err(VaultError::IdAlreadyTerminated { .. }) => {},
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = self.keys.retire(&child.id.as_string()) {
                warn!(child = %child.id, error = %e, "could not retire rolled-back key");
            }

            warn!(child = %child.id, "spawn rolled back: no first pulse");
            self.chain.append(AuditEvent::new(
                EventKind::SpawnRolledBack,
                now,
                AuditWriter::system("spawn"),
                Some(child.id),
                &json!({ "deadline": child.deadline.value(), "reason": "FIRST_PULSE_TIMEOUT" }),
            ))?;
            rolled_back.push(child.id);
        }
        Ok(rolled_back)
    }
}

impl std::fmt::Debug for SpawnGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
