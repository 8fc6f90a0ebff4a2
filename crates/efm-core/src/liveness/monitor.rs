//! Pulse accounting, ghost detection, and the liveness sweep.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::pulse::Pulse;
use crate::audit::{AuditChain, AuditError, AuditEvent, AuditWriter, EventKind};
use crate::capsule::{CapsuleId, CapsuleStatus};
use crate::clock::Tick;
use crate::registry::{CapsuleRegistry, RegistryError};
use crate::vault::{Vault, VaultError};

/// Liveness configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Expected interval between pulses, in ticks.
    #[serde(default = "default_interval")]
    pub interval_ticks: u64,

    /// Grace period added to the interval before a miss is counted.
    #[serde(default = "default_grace")]
    pub grace_ticks: u64,

    /// Misses after which the capsule is terminated.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,

    /// Ticks a quarantined capsule must pulse cleanly before recovery.
    #[serde(default = "default_probation")]
    pub probation_ticks: u64,
}

const fn default_interval() -> u64 {
    100
}

const fn default_grace() -> u64 {
    10
}

const fn default_max_missed() -> u32 {
    2
}

const fn default_probation() -> u64 {
    100
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ticks: default_interval(),
            grace_ticks: default_grace(),
            max_missed: default_max_missed(),
            probation_ticks: default_probation(),
        }
    }
}

/// Why a pulse was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseRejection {
    /// The claimed id is not registered (ghost with unknown identity).
    UnknownCapsule,
    /// The genesis hash does not match the vault.
    GenesisMismatch,
    /// The signature does not verify against the registered key.
    InvalidSignature,
    /// The tick is outside the acceptance window.
    StalePulse,
    /// The capsule is terminated (zombie pulse).
    Terminated,
}

impl PulseRejection {
    /// Canonical reason tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownCapsule => "UnknownCapsule",
            Self::GenesisMismatch => "GenesisMismatch",
            Self::InvalidSignature => "InvalidSignature",
            Self::StalePulse => "StalePulse",
            Self::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for PulseRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of submitting a pulse. A value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The pulse was accepted and the registry updated.
    Accepted {
        /// True if the acceptance completed quarantine probation.
        recovered: bool,
    },
    /// The pulse was rejected; a known claimed id is now quarantined.
    Rejected {
        /// The rejection reason.
        reason: PulseRejection,
        /// True if the claimed capsule was quarantined as a result.
        quarantined: bool,
    },
}

/// Action taken for one capsule during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// The capsule missed a pulse window and was quarantined.
    Missed {
        /// The capsule.
        id: CapsuleId,
        /// Miss count after the increment.
        misses: u32,
    },
    /// The capsule exhausted its miss allowance and was terminated.
    Terminated {
        /// The capsule.
        id: CapsuleId,
    },
}

/// Errors from liveness bookkeeping (infrastructure, not policy).
#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Vault failure.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Audit append failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// The liveness monitor.
///
/// Verifies pulses against the vault, maintains per-capsule miss counters,
/// quarantines ghosts immediately, and drives the missed-pulse state
/// machine: Active, Missed(k), Quarantined, then Recovered or Terminated.
pub struct LivenessMonitor {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        registry: Arc<CapsuleRegistry>,
        chain: Arc<AuditChain>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            vault,
            registry,
            chain,
            config,
        }
    }

    /// The configured liveness parameters.
    #[must_use]
    pub const fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Validates and applies a pulse.
    ///
    /// Acceptance requires: a registered, non-terminated id; a genesis hash
    /// matching the vault; a valid signature; and a tick inside
    /// `[last_accepted, now + grace]`. Any known-id failure quarantines the
    /// claimed capsule immediately and leaves its last-accepted tick
    /// untouched. Unknown ids are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (registry, vault,
    /// audit); rejections are values.
    pub fn submit_pulse(&self, pulse: &Pulse, now: Tick) -> Result<PulseOutcome, LivenessError> {
        let id = pulse.capsule_id;

        if let Some(reason) = self.validate(pulse, now)? {
            return self.reject(pulse, now, reason);
        }

        // Accepted: reset the miss counter and advance the window.
        let recovered = self.registry.with_slot(id, |slot| {
            slot.last_accepted_tick = pulse.tick.max(slot.last_accepted_tick);
            slot.miss_count = 0;
            slot.refresh_stage(now);

            if slot.status == CapsuleStatus::Quarantined {
                match slot.probation_until {
                    Some(deadline) if now >= deadline => {
                        slot.status = CapsuleStatus::Active;
                        slot.probation_until = None;
                        true
                    },
                    _ => false,
                }
            } else {
                false
            }
        })?;

        if recovered {
            info!(capsule = %id, %now, "capsule recovered from quarantine");
            self.chain.append(AuditEvent::new(
                EventKind::QuarantineRecovered,
                now,
                AuditWriter::system("liveness"),
                Some(id),
                &json!({ "tick": now.value() }),
            ))?;
        }

        Ok(PulseOutcome::Accepted { recovered })
    }

    fn validate(&self, pulse: &Pulse, now: Tick) -> Result<Option<PulseRejection>, LivenessError> {
        let id = pulse.capsule_id;

        if !self.vault.is_registered(id) {
            return Ok(Some(PulseRejection::UnknownCapsule));
        }
        if self.vault.is_terminated(id) {
            return Ok(Some(PulseRejection::Terminated));
        }

        let expected_genesis = self
            .vault
            .genesis_hash(id)
            .ok_or(VaultError::IdUnknown { id })?;
        if pulse.genesis_hash != expected_genesis {
            return Ok(Some(PulseRejection::GenesisMismatch));
        }

        let key = self.vault.public_key(id).ok_or(VaultError::IdUnknown { id })?;
        if !pulse.verify(&key) {
            return Ok(Some(PulseRejection::InvalidSignature));
        }

        let last_accepted = self.registry.with_slot(id, |slot| slot.last_accepted_tick)?;
        let upper = now.plus(self.config.grace_ticks);
        if pulse.tick < last_accepted || pulse.tick > upper {
            return Ok(Some(PulseRejection::StalePulse));
        }

        Ok(None)
    }

    fn reject(
        &self,
        pulse: &Pulse,
        now: Tick,
        reason: PulseRejection,
    ) -> Result<PulseOutcome, LivenessError> {
        let id = pulse.capsule_id;
        let known = reason != PulseRejection::UnknownCapsule;

        warn!(capsule = %id, %reason, "pulse rejected");
        self.chain.append(AuditEvent::new(
            EventKind::PulseRejected,
            now,
            AuditWriter::system("liveness"),
            known.then_some(id),
            &json!({
                "claimed_id": id.as_string(),
                "reason": reason.as_str(),
                "pulse_tick": pulse.tick.value(),
            }),
        ))?;

        if !known {
            return Ok(PulseOutcome::Rejected {
                reason,
                quarantined: false,
            });
        }

        // Ghost with a known identity: quarantine immediately unless the
        // capsule is already quarantined or terminated.
        let quarantined = self.registry.with_slot(id, |slot| {
            if slot.status == CapsuleStatus::Active {
                slot.status = CapsuleStatus::Quarantined;
                slot.probation_until = Some(now.plus(self.config.probation_ticks));
                true
            } else {
                false
            }
        })?;

        if quarantined {
            self.chain.append(AuditEvent::new(
                EventKind::QuarantineEntered,
                now,
                AuditWriter::system("liveness"),
                Some(id),
                &json!({ "cause": "ghost_pulse", "reason": reason.as_str() }),
            ))?;
        }

        Ok(PulseOutcome::Rejected {
            reason,
            quarantined,
        })
    }

    /// Sweeps every capsule's pulse window at tick `now`.
    ///
    /// The miss count is derived from elapsed time so the sweep may run at
    /// any cadence: a capsule accrues one miss per elapsed
    /// `interval + grace` window since its last accepted pulse. The first
    /// miss quarantines; reaching `max_missed` terminates with a vault
    /// tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures.
    pub fn sweep(&self, now: Tick) -> Result<Vec<SweepAction>, LivenessError> {
        let window = self.config.interval_ticks + self.config.grace_ticks;
        let mut actions = Vec::new();

        for id in self.registry.ids() {
            let observed = self.registry.with_slot(id, |slot| {
                if slot.status == CapsuleStatus::Terminated {
                    return None;
                }
                let elapsed = now.since(slot.last_accepted_tick);
                if elapsed == 0 {
                    return None;
                }
                #[allow(clippy::cast_possible_truncation)]
                let due = ((elapsed - 1) / window.max(1)) as u32;
                (due > slot.miss_count).then_some((slot.miss_count, due))
            })?;

            let Some((previous, due)) = observed else {
                continue;
            };

            for misses in (previous + 1)..=due {
                if misses >= self.config.max_missed {
                    self.terminate_for_liveness(id, now, misses)?;
                    actions.push(SweepAction::Terminated { id });
                    break;
                }
                self.mark_missed(id, now, misses)?;
                actions.push(SweepAction::Missed { id, misses });
            }
        }

        Ok(actions)
    }

    fn mark_missed(&self, id: CapsuleId, now: Tick, misses: u32) -> Result<(), LivenessError> {
        let newly_quarantined = self.registry.with_slot(id, |slot| {
            slot.miss_count = misses;
            if slot.status == CapsuleStatus::Active {
                slot.status = CapsuleStatus::Quarantined;
                slot.probation_until = Some(now.plus(self.config.probation_ticks));
                true
            } else {
                false
            }
        })?;

        warn!(capsule = %id, misses, "missed pulse window");
        self.chain.append(AuditEvent::new(
            EventKind::LivenessViolation,
            now,
            AuditWriter::system("liveness"),
            Some(id),
            &json!({ "misses": misses, "quarantined": newly_quarantined }),
        ))?;

        if newly_quarantined {
            self.chain.append(AuditEvent::new(
                EventKind::QuarantineEntered,
                now,
                AuditWriter::system("liveness"),
                Some(id),
                &json!({ "cause": "missed_pulse", "misses": misses }),
            ))?;
        }
        Ok(())
    }

    fn terminate_for_liveness(
        &self,
        id: CapsuleId,
        now: Tick,
        misses: u32,
    ) -> Result<(), LivenessError> {
        self.registry.with_slot(id, |slot| {
            slot.miss_count = misses;
            slot.status = CapsuleStatus::Terminated;
        })?;

        match self.vault.mark_terminated(id, "LIVENESS_FAILURE", now) {
            Ok(()) | Err(VaultError::IdAlreadyTerminated { .. }) => {},
            Err(e) => return Err(e.into()),
        }

        warn!(capsule = %id, misses, "terminated for liveness failure");
        self.chain.append(AuditEvent::new(
            EventKind::LivenessFailure,
            now,
            AuditWriter::system("liveness"),
            Some(id),
            &json!({ "misses": misses, "reason": "LIVENESS_FAILURE" }),
        ))?;
        self.chain.append(AuditEvent::new(
            EventKind::CapsuleTerminated,
            now,
            AuditWriter::system("liveness"),
            Some(id),
            &json!({ "reason": "LIVENESS_FAILURE" }),
        ))?;
        Ok(())
    }
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
