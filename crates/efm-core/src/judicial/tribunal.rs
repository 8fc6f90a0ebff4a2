//! Conflict tribunal: jury selection and verdict aggregation.

use serde::{Deserialize, Serialize};

use crate::capsule::{CapsuleId, CapsuleStatus};
use crate::registry::{CapsuleRegistry, RegistryError};

/// Tribunal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TribunalConfig {
    /// Jury size.
    #[serde(default = "default_jury_size")]
    pub jury_size: usize,

    /// Minimum juror composite health.
    #[serde(default = "default_min_health")]
    pub min_juror_health: f64,
}

const fn default_jury_size() -> usize {
    7
}

const fn default_min_health() -> f64 {
    0.7
}

impl Default for TribunalConfig {
    fn default() -> Self {
        Self {
            jury_size: default_jury_size(),
            min_juror_health: default_min_health(),
        }
    }
}

/// Aggregated verdict of a tribunal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TribunalVerdict {
    /// The selected jury.
    pub jury: Vec<CapsuleId>,

    /// Votes in favor of the first party.
    pub for_first_party: u32,

    /// Votes in favor of the second party.
    pub for_second_party: u32,

    /// The prevailing party, if the vote was not tied.
    pub prevailing: Option<CapsuleId>,
}

/// The conflict tribunal.
#[derive(Debug)]
pub struct Tribunal {
    config: TribunalConfig,
}

impl Tribunal {
    /// Creates a tribunal.
    #[must_use]
    pub const fn new(config: TribunalConfig) -> Self {
        Self { config }
    }

    /// Selects a jury for a conflict between two parties.
    ///
    /// Jurors must not be parties, must be active with composite health at
    /// or above the configured floor, and must share no lineage with either
    /// party. Candidates are taken in id order for determinism.
    ///
    /// # Errors
    ///
    /// Returns a registry error if a lineage walk fails.
    pub fn select_jury(
        &self,
        registry: &CapsuleRegistry,
        first_party: CapsuleId,
        second_party: CapsuleId,
    ) -> Result<Vec<CapsuleId>, RegistryError> {
        let mut party_lineage = registry.lineage_of(first_party)?;
        party_lineage.extend(registry.lineage_of(second_party)?);

        let snapshot = registry.snapshot();
        let mut jury = Vec::with_capacity(self.config.jury_size);

        for view in snapshot.capsules() {
            if jury.len() == self.config.jury_size {
                break;
            }
            if view.id == first_party || view.id == second_party {
                continue;
            }
            if view.status != CapsuleStatus::Active {
                continue;
            }
            if view.health_composite < self.config.min_juror_health {
                continue;
            }
            let lineage = registry.lineage_of(view.id)?;
            if lineage.iter().any(|id| party_lineage.contains(id)) {
                continue;
            }
            jury.push(view.id);
        }

        Ok(jury)
    }

    /// Aggregates juror votes into a verdict.
    ///
    /// `votes` pairs each juror with the party it found for.
    #[must_use]
    pub fn verdict(
        &self,
        jury: Vec<CapsuleId>,
        first_party: CapsuleId,
        second_party: CapsuleId,
        votes: &[(CapsuleId, CapsuleId)],
    ) -> TribunalVerdict {
        let mut for_first = 0u32;
        let mut for_second = 0u32;

        for (juror, found_for) in votes {
            if !jury.contains(juror) {
                continue;
            }
            if *found_for == first_party {
                for_first += 1;
            } else if *found_for == second_party {
                for_second += 1;
            }
        }

        let prevailing = match for_first.cmp(&for_second) {
            std::cmp::Ordering::Greater => Some(first_party),
            std::cmp::Ordering::Less => Some(second_party),
            std::cmp::Ordering::Equal => None,
        };

        TribunalVerdict {
            jury,
            for_first_party: for_first,
            for_second_party: for_second,
            prevailing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::HealthVector;
    use crate::clock::Tick;
    use crate::crypto::ContentHasher;
    use crate::governor::PriorityTier;
    use crate::registry::CapsuleSlot;
    use crate::tether::TetherTable;

    fn insert(registry: &CapsuleRegistry, parent: Option<CapsuleId>, depth: u32, health: f64) -> CapsuleId {
        let id = CapsuleId::generate();
        registry
            .insert(CapsuleSlot::new(
                id,
                parent,
                depth,
                ContentHasher::hash("efm.test", id.as_string().as_bytes()),
                Tick::ZERO,
                PriorityTier::Normal,
                TetherTable::default().low,
            ))
            .unwrap();
        registry
            .with_slot(id, |s| s.health = HealthVector::new(health, health, health, 0.0))
            .unwrap();
        id
    }

    #[test]
    fn jury_excludes_parties_kin_and_unhealthy() {
        let registry = CapsuleRegistry::new();
        let party_a = insert(&registry, None, 0, 0.9);
        let party_b = insert(&registry, None, 0, 0.9);
        let kin_of_a = insert(&registry, Some(party_a), 1, 0.9);
        let unhealthy = insert(&registry, None, 0, 0.5);
        let eligible1 = insert(&registry, None, 0, 0.9);
        let eligible2 = insert(&registry, None, 0, 0.8);

        let tribunal = Tribunal::new(TribunalConfig::default());
        let jury = tribunal.select_jury(&registry, party_a, party_b).unwrap();

        assert!(!jury.contains(&party_a));
        assert!(!jury.contains(&party_b));
        assert!(!jury.contains(&kin_of_a));
        assert!(!jury.contains(&unhealthy));
        assert!(jury.contains(&eligible1));
        assert!(jury.contains(&eligible2));
    }

    #[test]
    fn jury_is_bounded_by_configured_size() {
        let registry = CapsuleRegistry::new();
        let party_a = insert(&registry, None, 0, 0.9);
        let party_b = insert(&registry, None, 0, 0.9);
        for _ in 0..12 {
            insert(&registry, None, 0, 0.9);
        }

        let tribunal = Tribunal::new(TribunalConfig::default());
        let jury = tribunal.select_jury(&registry, party_a, party_b).unwrap();
        assert_eq!(jury.len(), 7);
    }

    #[test]
    fn verdict_counts_only_jurors() {
        let registry = CapsuleRegistry::new();
        let party_a = insert(&registry, None, 0, 0.9);
        let party_b = insert(&registry, None, 0, 0.9);
        let jurors: Vec<CapsuleId> = (0..3).map(|_| insert(&registry, None, 0, 0.9)).collect();

        let tribunal = Tribunal::new(TribunalConfig::default());
        let outsider = CapsuleId::generate();
        let votes = vec![
            (jurors[0], party_a),
            (jurors[1], party_a),
            (jurors[2], party_b),
            (outsider, party_b),
        ];

        let verdict = tribunal.verdict(jurors.clone(), party_a, party_b, &votes);
        assert_eq!(verdict.for_first_party, 2);
        assert_eq!(verdict.for_second_party, 1);
        assert_eq!(verdict.prevailing, Some(party_a));
    }

    #[test]
    fn tied_verdict_has_no_prevailing_party() {
        let tribunal = Tribunal::new(TribunalConfig::default());
        let a = CapsuleId::generate();
        let b = CapsuleId::generate();
        let j1 = CapsuleId::generate();
        let j2 = CapsuleId::generate();

        let verdict = tribunal.verdict(vec![j1, j2], a, b, &[(j1, a), (j2, b)]);
        assert_eq!(verdict.prevailing, None);
    }
}
