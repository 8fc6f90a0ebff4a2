//! # efm-core
//!
//! Core library for the EFM runtime - a policy-enforced execution substrate
//! for a swarm of cooperating agent capsules.
//!
//! Every capsule action is filtered through a five-stage decision pipeline,
//! witnessed by an append-only forensic audit chain, and governed by adaptive
//! resource and liveness controls.
//!
//! ## Subsystems
//!
//! - **Vault**: immutable constitutional store (genesis records, keys,
//!   termination tombstones)
//! - **Audit chain**: append-only, hash-linked event log with indexed query
//! - **Registry**: per-capsule runtime state with slot-level ownership
//! - **Stress / Tether**: scalar stress signal mapped to behavioral bounds
//! - **Resource governor**: tiered budgets with circuit breakers
//! - **Liveness monitor**: signed pulse accounting, ghost detection, spawn
//!   admission
//! - **Sandbox enforcer**: four-level isolation with escape detection
//! - **Decision pipeline**: Reflex, Intuition, Coherence, Arbiter,
//!   Deliberation
//! - **Message bus**: signed, TTL-bounded, priority-queued routing
//! - **Judicial**: precedent court, quorum voting, conflict tribunal, SCI
//! - **Gardener**: authenticated operator override channel
//!
//! ## Example
//!
//! ```rust
//! use efm_core::clock::TickSource;
//! use efm_core::crypto::{Keyring, ROOT_AUTHORITY};
//! use efm_core::vault::Vault;
//!
//! # fn main() -> Result<(), efm_core::crypto::KeyringError> {
//! let clock = TickSource::new();
//! let keys = Keyring::in_memory();
//! let root = keys.issue(ROOT_AUTHORITY)?;
//! let vault = Vault::new(root.public_key());
//! assert_eq!(clock.now().value(), 0);
//! assert_eq!(vault.registered_count(), 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod bus;
pub mod capsule;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod gardener;
pub mod governor;
pub mod judicial;
pub mod liveness;
pub mod pipeline;
pub mod registry;
pub mod sandbox;
pub mod stress;
pub mod tether;
pub mod vault;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::audit::{AuditChain, AuditEntry, EventKind};
    pub use crate::capsule::{CapsuleId, CapsuleStatus, GenesisRecord, HealthVector};
    pub use crate::clock::{Tick, TickSource};
    pub use crate::config::RuntimeConfig;
    pub use crate::registry::CapsuleRegistry;
    pub use crate::stress::StressLevel;
    pub use crate::vault::Vault;
}

pub use capsule::{CapsuleId, CapsuleStatus, GenesisRecord};
pub use clock::{Tick, TickSource};
pub use config::RuntimeConfig;
pub use registry::CapsuleRegistry;
pub use vault::Vault;
