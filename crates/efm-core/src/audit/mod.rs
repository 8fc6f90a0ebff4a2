//! Append-only forensic audit chain.
//!
//! Every governance decision in the runtime is witnessed here. The chain
//! is:
//!
//! - **Append-only**: entries are never modified or deleted
//! - **Hash-linked**: each entry's `prev_hash` equals the previous entry's
//!   content hash; the genesis entry links to a fixed all-zero sentinel
//! - **Single-writer**: appends are serialized through a dedicated
//!   committer task fed by a bounded channel
//! - **Queryable**: indexed by capsule, event tag, and tick range
//!
//! `append` is a sink: it never rejects on semantics. Corruption detection
//! is a monitor ([`AuditChain::verify_range`]), not a gate.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use efm_core::audit::{
//!     AuditChain, AuditEvent, AuditWriter, EventKind, MemoryAuditBackend, VerifyOutcome,
//! };
//! use efm_core::clock::Tick;
//!
//! # fn main() -> Result<(), efm_core::audit::AuditError> {
//! let chain = AuditChain::new(Arc::new(MemoryAuditBackend::new()), None)?;
//!
//! let event = AuditEvent::new(
//!     EventKind::StressLevelChanged,
//!     Tick::new(10),
//!     AuditWriter::system("stress"),
//!     None,
//!     &serde_json::json!({ "level": "high" }),
//! );
//! let (seq, _hash) = chain.append(event)?;
//!
//! assert_eq!(seq, 1);
//! assert_eq!(chain.verify_range(1, 1)?, VerifyOutcome::Ok);
//! # Ok(())
//! # }
//! ```

mod backend;
mod chain;
mod committer;
mod entry;
mod kind;


pub use backend::{AuditBackend, AuditError, MemoryAuditBackend, SqliteAuditBackend};
pub use chain::{AuditChain, VerifyOutcome};
pub use committer::{
    AuditHandle, DEFAULT_QUEUE_CAPACITY, Durability, spawn_committer,
};
pub use entry::{AuditEntry, AuditEvent, AuditWriter};
pub use kind::EventKind;
