//! Capsule registry.
//!
//! The registry exclusively owns each capsule's mutable runtime state. A
//! capsule's state lives in a slot behind its own mutex; the outer map is
//! read-locked on the hot path. Cross-capsule operations acquire slots in
//! id order, which precludes deadlock.
//!
//! Tether publication is atomic per capsule: the slot stores an
//! `Arc<TetherVector>` that is swapped whole, so a reader never observes a
//! mixed vector.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::capsule::{CapsuleId, CapsuleStatus, GrowthMode, HealthVector, LifecycleStage};
use crate::clock::Tick;
use crate::crypto::ContentHash;
use crate::governor::{PriorityTier, ResourceBudget};
use crate::tether::TetherVector;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The capsule id is not registered.
    #[error("unknown capsule: {id}")]
    UnknownCapsule {
        /// The unknown id.
        id: CapsuleId,
    },

    /// An operation would violate a registry invariant.
    #[error("invariant violation: {details}")]
    InvariantViolation {
        /// What was violated.
        details: String,
    },
}

/// Mutable runtime state of one capsule.
#[derive(Debug, Clone)]
pub struct CapsuleSlot {
    /// Capsule id.
    pub id: CapsuleId,

    /// Parent id; `None` for the root.
    pub parent_id: Option<CapsuleId>,

    /// Lineage depth.
    pub lineage_depth: u32,

    /// Stable genesis hash.
    pub genesis_hash: ContentHash,

    /// Creation tick.
    pub created_tick: Tick,

    /// Derived lifecycle stage.
    pub stage: LifecycleStage,

    /// Runtime status.
    pub status: CapsuleStatus,

    /// Health vector.
    pub health: HealthVector,

    /// Growth mode.
    pub growth_mode: GrowthMode,

    /// Priority tier.
    pub tier: PriorityTier,

    /// Published tether vector (swapped whole).
    pub tether: Arc<TetherVector>,

    /// Current resource budget.
    pub budget: ResourceBudget,

    /// Tick of the last accepted pulse; creation tick until the first
    /// pulse arrives.
    pub last_accepted_tick: Tick,

    /// Consecutive missed pulse windows.
    pub miss_count: u32,

    /// Quarantine probation deadline; recovery is allowed once this tick
    /// has passed with clean pulses.
    pub probation_until: Option<Tick>,
}

impl CapsuleSlot {
    /// Creates a fresh slot for a newly registered capsule.
    #[must_use]
    pub fn new(
        id: CapsuleId,
        parent_id: Option<CapsuleId>,
        lineage_depth: u32,
        genesis_hash: ContentHash,
        created_tick: Tick,
        tier: PriorityTier,
        tether: TetherVector,
    ) -> Self {
        Self {
            id,
            parent_id,
            lineage_depth,
            genesis_hash,
            created_tick,
            stage: LifecycleStage::Genesis,
            status: CapsuleStatus::Active,
            health: HealthVector::PERFECT,
            growth_mode: GrowthMode::Open,
            tier,
            tether: Arc::new(tether),
            budget: ResourceBudget::default(),
            last_accepted_tick: created_tick,
            miss_count: 0,
            probation_until: None,
        }
    }

    /// Re-derives the lifecycle stage from age and health.
    pub fn refresh_stage(&mut self, now: Tick) {
        self.stage = LifecycleStage::derive(now.since(self.created_tick), self.health.composite());
    }
}

/// Read-only view of one capsule, captured in a snapshot.
#[derive(Debug, Clone)]
pub struct CapsuleView {
    /// Capsule id.
    pub id: CapsuleId,
    /// Parent id.
    pub parent_id: Option<CapsuleId>,
    /// Lineage depth.
    pub lineage_depth: u32,
    /// Status at capture.
    pub status: CapsuleStatus,
    /// Lifecycle stage at capture.
    pub stage: LifecycleStage,
    /// Composite health at capture.
    pub health_composite: f64,
    /// Entropy component at capture.
    pub entropy: f64,
    /// Tether vector at capture.
    pub tether: Arc<TetherVector>,
}

/// A coherent point-in-time view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    capsules: Vec<CapsuleView>,
}

impl RegistrySnapshot {
    /// All captured capsules.
    #[must_use]
    pub fn capsules(&self) -> &[CapsuleView] {
        &self.capsules
    }

    /// Looks up one capsule's view.
    #[must_use]
    pub fn get(&self, id: CapsuleId) -> Option<&CapsuleView> {
        self.capsules.iter().find(|c| c.id == id)
    }

    /// Mean composite health over active capsules (1.0 when empty).
    #[must_use]
    pub fn mean_health(&self) -> f64 {
        mean(
            self.capsules
                .iter()
                .filter(|c| c.status == CapsuleStatus::Active)
                .map(|c| c.health_composite),
        )
        .unwrap_or(1.0)
    }

    /// Mean entropy over active capsules (0.0 when empty).
    #[must_use]
    pub fn mean_entropy(&self) -> f64 {
        mean(
            self.capsules
                .iter()
                .filter(|c| c.status == CapsuleStatus::Active)
                .map(|c| c.entropy),
        )
        .unwrap_or(0.0)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0u32;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / f64::from(count))
    }
}

/// The capsule registry.
#[derive(Default)]
pub struct CapsuleRegistry {
    slots: RwLock<HashMap<CapsuleId, Arc<Mutex<CapsuleSlot>>>>,
}

impl CapsuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a slot for a newly registered capsule.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvariantViolation`] if the id is already
    /// present; registration happens exactly once per id.
    pub fn insert(&self, slot: CapsuleSlot) -> Result<(), RegistryError> {
        let mut slots = self.slots.write().unwrap();
        if slots.contains_key(&slot.id) {
            return Err(RegistryError::InvariantViolation {
                details: format!("capsule {} already registered", slot.id),
            });
        }
        slots.insert(slot.id, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    /// Runs `f` with exclusive access to one capsule's slot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCapsule`] if the id is absent.
    pub fn with_slot<T>(
        &self,
        id: CapsuleId,
        f: impl FnOnce(&mut CapsuleSlot) -> T,
    ) -> Result<T, RegistryError> {
        let slot = {
            let slots = self.slots.read().unwrap();
            slots
                .get(&id)
                .cloned()
                .ok_or(RegistryError::UnknownCapsule { id })?
        };
        let mut guard = slot.lock().unwrap();
        Ok(f(&mut guard))
    }

    /// Runs `f` with exclusive access to two slots, acquired in id order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCapsule`] if either id is absent, or
    /// [`RegistryError::InvariantViolation`] if the ids are equal.
    pub fn with_two_slots<T>(
        &self,
        a: CapsuleId,
        b: CapsuleId,
        f: impl FnOnce(&mut CapsuleSlot, &mut CapsuleSlot) -> T,
    ) -> Result<T, RegistryError> {
        if a == b {
            return Err(RegistryError::InvariantViolation {
                details: "two-slot operation on a single capsule".to_string(),
            });
        }

        let (slot_a, slot_b) = {
            let slots = self.slots.read().unwrap();
            (
                slots
                    .get(&a)
                    .cloned()
                    .ok_or(RegistryError::UnknownCapsule { id: a })?,
                slots
                    .get(&b)
                    .cloned()
                    .ok_or(RegistryError::UnknownCapsule { id: b })?,
            )
        };

        // Lock in id order so concurrent pair operations cannot deadlock.
        if a < b {
            let mut guard_a = slot_a.lock().unwrap();
            let mut guard_b = slot_b.lock().unwrap();
            Ok(f(&mut guard_a, &mut guard_b))
        } else {
            let mut guard_b = slot_b.lock().unwrap();
            let mut guard_a = slot_a.lock().unwrap();
            Ok(f(&mut guard_a, &mut guard_b))
        }
    }

    /// Transitions a capsule's status, enforcing monotonicity.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownCapsule`] if the id is absent.
    /// - [`RegistryError::InvariantViolation`] for an illegal transition.
    pub fn set_status(&self, id: CapsuleId, next: CapsuleStatus) -> Result<(), RegistryError> {
        self.with_slot(id, |slot| {
            if !slot.status.can_transition_to(next) {
                return Err(RegistryError::InvariantViolation {
                    details: format!("illegal status transition {} -> {next} for {id}", slot.status),
                });
            }
            slot.status = next;
            Ok(())
        })?
    }

    /// Current status of a capsule.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCapsule`] if the id is absent.
    pub fn status(&self, id: CapsuleId) -> Result<CapsuleStatus, RegistryError> {
        self.with_slot(id, |slot| slot.status)
    }

    /// The capsule's currently published tether vector.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCapsule`] if the id is absent.
    pub fn tether(&self, id: CapsuleId) -> Result<Arc<TetherVector>, RegistryError> {
        self.with_slot(id, |slot| slot.tether.clone())
    }

    /// Swaps every registered capsule's tether vector.
    ///
    /// Returns the number of capsules updated.
    pub fn publish_tethers(&self, vector: TetherVector) -> usize {
        let slots: Vec<_> = {
            let map = self.slots.read().unwrap();
            map.values().cloned().collect()
        };
        let mut updated = 0;
        for slot in slots {
            let mut guard = slot.lock().unwrap();
            if guard.status != CapsuleStatus::Terminated {
                guard.tether = Arc::new(vector);
                updated += 1;
            }
        }
        updated
    }

    /// All registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<CapsuleId> {
        let mut ids: Vec<_> = self.slots.read().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of registered capsules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Returns true if no capsule is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().unwrap().is_empty()
    }

    /// Walks the lineage from `id` to the root (inclusive of `id`).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownCapsule`] if `id` is absent; an
    /// absent ancestor ends the walk instead of erroring.
    pub fn lineage_of(&self, id: CapsuleId) -> Result<Vec<CapsuleId>, RegistryError> {
        let mut lineage = vec![id];
        let mut cursor = self.with_slot(id, |slot| slot.parent_id)?;
        while let Some(parent) = cursor {
            lineage.push(parent);
            cursor = match self.with_slot(parent, |slot| slot.parent_id) {
                Ok(next) => next,
                Err(RegistryError::UnknownCapsule { .. }) => None,
                Err(e) => return Err(e),
            };
        }
        Ok(lineage)
    }

    /// Captures a coherent snapshot of every capsule.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let slots: Vec<_> = {
            let map = self.slots.read().unwrap();
            map.values().cloned().collect()
        };
        let mut capsules: Vec<CapsuleView> = slots
            .iter()
            .map(|slot| {
                let guard = slot.lock().unwrap();
                CapsuleView {
                    id: guard.id,
                    parent_id: guard.parent_id,
                    lineage_depth: guard.lineage_depth,
                    status: guard.status,
                    stage: guard.stage,
                    health_composite: guard.health.composite(),
                    entropy: guard.health.entropy,
                    tether: guard.tether.clone(),
                }
            })
            .collect();
        capsules.sort_by_key(|c| c.id);
        RegistrySnapshot { capsules }
    }
}

impl std::fmt::Debug for CapsuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
