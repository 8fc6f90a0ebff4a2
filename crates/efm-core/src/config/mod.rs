//! Typed runtime configuration.
//!
//! One TOML document configures every subsystem. Section types live with
//! the subsystems they configure; this module aggregates them, supplies
//! the documented defaults, and validates cross-field invariants before
//! the daemon brings anything up. An invalid document is exit code 40.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::Durability;
use crate::bus::BusConfig;
use crate::governor::{AllocationTable, BreakerThresholds, BudgetBaseline};
use crate::judicial::{QuorumConfig, SciWeights, TribunalConfig};
use crate::liveness::{LivenessConfig, SpawnConfig};
use crate::pipeline::{MotifLibrary, PipelineThresholds, StageBudgets};
use crate::sandbox::SandboxConfig;
use crate::stress::{StressThresholds, StressWeights};
use crate::tether::TetherTable;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be parsed.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value violates a documented constraint.
    #[error("invalid config: {key}: {details}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// What is wrong.
        details: String,
    },
}

/// Host scheduling section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSection {
    /// Wall-clock duration of one logical tick.
    #[serde(default = "default_tick_interval")]
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

const fn default_tick_interval() -> Duration {
    Duration::from_millis(10)
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

/// Stress monitor section.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StressSection {
    /// Formula weights.
    #[serde(default)]
    pub weights: StressWeights,

    /// Discretization thresholds.
    #[serde(default)]
    pub thresholds: StressThresholds,
}

/// Pipeline section.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Per-stage latency budgets.
    #[serde(default)]
    pub budgets: StageBudgets,
}

/// Coherence stage section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoherenceSection {
    /// Projected entropy delta threshold.
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
}

const fn default_entropy_threshold() -> f64 {
    0.80
}

impl Default for CoherenceSection {
    fn default() -> Self {
        Self {
            entropy_threshold: default_entropy_threshold(),
        }
    }
}

/// Intuition stage section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntuitionSection {
    /// Danger motif similarity threshold.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

const fn default_similarity_threshold() -> f64 {
    0.75
}

impl Default for IntuitionSection {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Audit chain section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSection {
    /// Committer durability mode.
    #[serde(default)]
    pub durability: Durability,

    /// Retention for non-lifecycle entries, in days; 0 keeps everything.
    #[serde(default)]
    pub retention_days: u32,

    /// Committer intake queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Path of the audit database; `None` keeps the chain in memory.
    #[serde(default)]
    pub db_path: Option<std::path::PathBuf>,
}

const fn default_queue_capacity() -> usize {
    crate::audit::DEFAULT_QUEUE_CAPACITY
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            durability: Durability::default(),
            retention_days: 0,
            queue_capacity: default_queue_capacity(),
            db_path: None,
        }
    }
}

/// Override channel section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSection {
    /// Latency budget from authenticated receipt to effect.
    #[serde(default = "default_latency_budget")]
    pub latency_budget_ms: u64,
}

const fn default_latency_budget() -> u64 {
    crate::gardener::DEFAULT_LATENCY_BUDGET_MS
}

impl Default for OverrideSection {
    fn default() -> Self {
        Self {
            latency_budget_ms: default_latency_budget(),
        }
    }
}

/// Resource governor section.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GovernorSection {
    /// Baseline amounts.
    #[serde(default)]
    pub baseline: BudgetBaseline,

    /// Stress-dependent tier ratios.
    #[serde(default)]
    pub allocation: AllocationTable,
}

/// Judicial section.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JudicialSection {
    /// Quorum parameters.
    #[serde(default)]
    pub quorum: QuorumConfig,

    /// Tribunal parameters.
    #[serde(default)]
    pub tribunal: TribunalConfig,

    /// SCI component weights.
    #[serde(default)]
    pub sci_weights: SciWeights,
}

/// The complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Host scheduling parameters.
    #[serde(default)]
    pub host: HostSection,

    /// Liveness (pulse) parameters.
    #[serde(default)]
    pub pulse: LivenessConfig,

    /// Stress monitor parameters.
    #[serde(default)]
    pub stress: StressSection,

    /// Spawn governance parameters.
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Circuit breaker trip thresholds.
    #[serde(default)]
    pub circuit_breakers: BreakerThresholds,

    /// Pipeline stage budgets.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Coherence stage threshold.
    #[serde(default)]
    pub coherence: CoherenceSection,

    /// Intuition stage threshold.
    #[serde(default)]
    pub intuition: IntuitionSection,

    /// Sandbox enforcement parameters.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Audit chain parameters.
    #[serde(default)]
    pub audit: AuditSection,

    /// Override channel parameters.
    #[serde(default, rename = "override")]
    pub override_channel: OverrideSection,

    /// Message bus parameters.
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-level tether bounds.
    #[serde(default)]
    pub tethers: TetherTable,

    /// Resource governor tables.
    #[serde(default)]
    pub governor: GovernorSection,

    /// Judicial parameters.
    #[serde(default)]
    pub judicial: JudicialSection,

    /// Motif library content (supplied externally).
    #[serde(default)]
    pub motifs: MotifLibrary,
}

impl RuntimeConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error; the host maps these to exit
    /// code 40.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a read, parse, or validation error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml_str(&document)
    }

    /// The pipeline thresholds assembled from their sections.
    #[must_use]
    pub const fn pipeline_thresholds(&self) -> PipelineThresholds {
        PipelineThresholds {
            similarity_threshold: self.intuition.similarity_threshold,
            entropy_threshold: self.coherence.entropy_threshold,
        }
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, details: String| ConfigError::Invalid { key, details };

        let weight_sum = self.stress.weights.health
            + self.stress.weights.entropy
            + self.stress.weights.resources
            + self.stress.weights.sci;
        if (weight_sum - 1.0).abs() > 1e-9 {
            return Err(invalid(
                "stress.weights",
                format!("weights must sum to 1.0, got {weight_sum}"),
            ));
        }

        let t = &self.stress.thresholds;
        if !(0.0 < t.low && t.low < t.medium && t.medium < t.high && t.high < 1.0) {
            return Err(invalid(
                "stress.thresholds",
                format!("thresholds must be strictly ordered in (0, 1), got {t:?}"),
            ));
        }

        if self.host.tick_interval.is_zero() {
            return Err(invalid("host.tick_interval", "must be non-zero".to_string()));
        }

        if self.pulse.interval_ticks == 0 {
            return Err(invalid("pulse.interval_ticks", "must be non-zero".to_string()));
        }
        if self.pulse.max_missed == 0 {
            return Err(invalid("pulse.max_missed", "must be non-zero".to_string()));
        }

        if self.spawn.max_depth == 0 {
            return Err(invalid("spawn.max_depth", "must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.spawn.min_parent_health) {
            return Err(invalid(
                "spawn.min_parent_health",
                "must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.spawn.min_sci) {
            return Err(invalid("spawn.min_sci", "must be in [0, 1]".to_string()));
        }

        if !(0.0..=1.0).contains(&self.coherence.entropy_threshold) {
            return Err(invalid(
                "coherence.entropy_threshold",
                "must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.intuition.similarity_threshold) {
            return Err(invalid(
                "intuition.similarity_threshold",
                "must be in [0, 1]".to_string(),
            ));
        }

        let budgets = &self.pipeline.budgets;
        for (key, value) in [
            ("pipeline.budgets.reflex_ms", budgets.reflex_ms),
            ("pipeline.budgets.intuition_ms", budgets.intuition_ms),
            ("pipeline.budgets.coherence_ms", budgets.coherence_ms),
            ("pipeline.budgets.arbiter_ms", budgets.arbiter_ms),
            ("pipeline.budgets.deliberation_ms", budgets.deliberation_ms),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be non-zero".to_string()));
            }
        }

        if !self.tethers.is_monotone() {
            return Err(invalid(
                "tethers",
                "rising stress must never add tether slack".to_string(),
            ));
        }

        for (key, threshold) in [
            ("circuit_breakers.spawn", self.circuit_breakers.spawn),
            ("circuit_breakers.lineage", self.circuit_breakers.lineage),
            (
                "circuit_breakers.sci_broadcast",
                self.circuit_breakers.sci_broadcast,
            ),
            ("circuit_breakers.allocation", self.circuit_breakers.allocation),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(invalid(key, "must be in [0, 1]".to_string()));
            }
        }

        if self.sandbox.violation_threshold == 0 {
            return Err(invalid(
                "sandbox.violation_threshold",
                "must be non-zero".to_string(),
            ));
        }

        if self.override_channel.latency_budget_ms == 0 {
            return Err(invalid(
                "override.latency_budget_ms",
                "must be non-zero".to_string(),
            ));
        }

        if self.audit.queue_capacity == 0 {
            return Err(invalid("audit.queue_capacity", "must be non-zero".to_string()));
        }

        let quorum = &self.judicial.quorum;
        if !(0.0 < quorum.approval_fraction && quorum.approval_fraction <= 1.0) {
            return Err(invalid(
                "judicial.quorum.approval_fraction",
                "must be in (0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_the_documented_numbers() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();

        assert_eq!(config.pulse.interval_ticks, 100);
        assert_eq!(config.pulse.grace_ticks, 10);
        assert_eq!(config.pulse.max_missed, 2);
        assert_eq!(config.spawn.max_depth, 10);
        assert!((config.coherence.entropy_threshold - 0.80).abs() < f64::EPSILON);
        assert!((config.intuition.similarity_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.sandbox.violation_threshold, 3);
        assert!(config.sandbox.auto_escalate_on_critical);
        assert_eq!(config.override_channel.latency_budget_ms, 100);
        assert_eq!(config.audit.durability, Durability::Sync);
    }

    #[test]
    fn empty_document_parses_to_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn documented_keys_parse() {
        let document = r#"
            [host]
            tick_interval = "5ms"

            [pulse]
            interval_ticks = 50
            grace_ticks = 5
            max_missed = 3

            [stress.weights]
            health = 0.4
            entropy = 0.2
            resources = 0.2
            sci = 0.2

            [stress.thresholds]
            low = 0.2
            medium = 0.4
            high = 0.7

            [spawn]
            max_depth = 6

            [spawn.limits]
            low = 10
            medium = 5
            high = 2
            critical = 0

            [circuit_breakers]
            spawn = 0.7
            lineage = 0.7
            sci_broadcast = 0.5
            allocation = 0.9

            [pipeline.budgets]
            reflex_ms = 10
            intuition_ms = 20
            coherence_ms = 30
            arbiter_ms = 100
            deliberation_ms = 4000

            [coherence]
            entropy_threshold = 0.8

            [intuition]
            similarity_threshold = 0.75

            [sandbox]
            violation_threshold = 3
            auto_escalate_on_critical = true

            [audit]
            durability = "BATCH"
            retention_days = 30

            [override]
            latency_budget_ms = 100
        "#;

        let config = RuntimeConfig::from_toml_str(document).unwrap();
        assert_eq!(config.host.tick_interval, Duration::from_millis(5));
        assert_eq!(config.pulse.interval_ticks, 50);
        assert_eq!(config.spawn.limits.low, 10);
        assert_eq!(config.audit.durability, Durability::Batch);
        assert_eq!(config.audit.retention_days, 30);
        assert_eq!(config.pipeline.budgets.deliberation_ms, 4_000);
    }

    #[test]
    fn bad_weight_sum_is_rejected() {
        let document = r"
            [stress.weights]
            health = 0.9
            entropy = 0.9
            resources = 0.9
            sci = 0.9
        ";
        let result = RuntimeConfig::from_toml_str(document);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "stress.weights",
                ..
            })
        ));
    }

    #[test]
    fn unordered_thresholds_are_rejected() {
        let document = r"
            [stress.thresholds]
            low = 0.5
            medium = 0.25
            high = 0.75
        ";
        let result = RuntimeConfig::from_toml_str(document);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "stress.thresholds",
                ..
            })
        ));
    }

    #[test]
    fn slack_adding_tether_table_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.tethers.critical.exploration_radius = 0.95;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "tethers", .. })
        ));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let document = r"
            [pipeline.budgets]
            arbiter_ms = 0
        ";
        let result = RuntimeConfig::from_toml_str(document);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let result = RuntimeConfig::from_toml_str("not = [valid");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
