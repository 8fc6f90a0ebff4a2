//! The hash-linked forensic chain.
//!
//! [`AuditChain`] is the single logical writer over an [`AuditBackend`].
//! It assigns contiguous sequence numbers, links each entry to the previous
//! entry's content hash, and signs entries with the committer key when one
//! is configured. `append` never rejects on semantics; the chain is a sink.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::backend::{AuditBackend, AuditError};
use super::entry::{AUDIT_DOMAIN, AuditEntry, AuditEvent};
use super::kind::EventKind;
use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::{ContentHash, ContentHasher, GENESIS_PREV_HASH, Signer};

/// Result of verifying a chain range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Every entry in the range hashes and links correctly.
    Ok,
    /// The first sequence number at which the chain breaks.
    FirstBreakAt(u64),
}

impl VerifyOutcome {
    /// Returns true if the range verified clean.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

struct WriterState {
    next_seq: u64,
    prev_hash: ContentHash,
}

/// The append-only forensic chain.
pub struct AuditChain {
    backend: Arc<dyn AuditBackend>,
    signer: Option<Signer>,
    writer: Mutex<WriterState>,
}

impl AuditChain {
    /// Creates a chain over a backend, resuming from the backend's head.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend head cannot be read.
    pub fn new(backend: Arc<dyn AuditBackend>, signer: Option<Signer>) -> Result<Self, AuditError> {
        let (next_seq, prev_hash) = match backend.head_entry()? {
            Some(head) => (head.seq + 1, head.content_hash),
            None => (1, GENESIS_PREV_HASH),
        };
        Ok(Self {
            backend,
            signer,
            writer: Mutex::new(WriterState {
                next_seq,
                prev_hash,
            }),
        })
    }

    /// Appends an event, returning the assigned sequence number and the
    /// entry's content hash.
    ///
    /// The entry is durably stored before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AppendFailed`] wrapping the backend failure;
    /// semantics never cause rejection.
    pub fn append(&self, event: AuditEvent) -> Result<(u64, ContentHash), AuditError> {
        let mut writer = self.writer.lock().unwrap();

        let seq = writer.next_seq;
        let canonical = AuditEntry::canonical_bytes_of(
            seq,
            event.kind,
            event.tick,
            &event.writer,
            event.capsule_id,
            &event.payload,
        );
        let content_hash = ContentHasher::hash_linked(AUDIT_DOMAIN, &canonical, &writer.prev_hash);
        let signature = self
            .signer
            .as_ref()
            .map(|s| s.sign(content_hash.as_bytes()));

        let entry = AuditEntry {
            seq,
            prev_hash: writer.prev_hash,
            kind: event.kind,
            tick: event.tick,
            writer: event.writer,
            capsule_id: event.capsule_id,
            payload: event.payload,
            content_hash,
            signature,
        };

        self.backend
            .insert(&entry)
            .map_err(|e| AuditError::AppendFailed {
                details: e.to_string(),
            })?;

        writer.next_seq = seq + 1;
        writer.prev_hash = content_hash;

        debug!(seq, kind = %entry.kind, tick = %entry.tick, "audit entry committed");
        Ok((seq, content_hash))
    }

    /// Current head sequence number (0 when empty).
    #[must_use]
    pub fn head_seq(&self) -> u64 {
        self.writer.lock().unwrap().next_seq - 1
    }

    /// Recomputes hashes and link integrity over `from..=to`.
    ///
    /// Verification is a pure function of stored entries; running it twice
    /// over the same range yields the same outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures; a broken chain is
    /// reported through [`VerifyOutcome::FirstBreakAt`].
    pub fn verify_range(&self, from: u64, to: u64) -> Result<VerifyOutcome, AuditError> {
        if from == 0 || to < from {
            return Ok(VerifyOutcome::Ok);
        }

        let mut expected_prev = if from == 1 {
            GENESIS_PREV_HASH
        } else {
            match self.backend.read_one(from - 1) {
                Ok(prev) => prev.content_hash,
                Err(AuditError::EntryNotFound { .. }) => return Ok(VerifyOutcome::FirstBreakAt(from)),
                Err(e) => return Err(e),
            }
        };

        let entries = self.backend.read_range(from, to)?;
        let mut expected_seq = from;

        for entry in entries {
            if entry.seq != expected_seq {
                return Ok(VerifyOutcome::FirstBreakAt(expected_seq));
            }
            if entry.prev_hash != expected_prev {
                return Ok(VerifyOutcome::FirstBreakAt(entry.seq));
            }
            if entry.expected_content_hash() != entry.content_hash {
                return Ok(VerifyOutcome::FirstBreakAt(entry.seq));
            }
            if let (Some(signer), Some(sig)) = (&self.signer, &entry.signature) {
                if !signer.verify(entry.content_hash.as_bytes(), sig) {
                    return Ok(VerifyOutcome::FirstBreakAt(entry.seq));
                }
            }
            expected_prev = entry.content_hash;
            expected_seq += 1;
        }

        if expected_seq <= to && expected_seq <= self.head_seq() {
            // A gap inside the requested range.
            return Ok(VerifyOutcome::FirstBreakAt(expected_seq));
        }

        Ok(VerifyOutcome::Ok)
    }

    /// Reads one entry by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::EntryNotFound`] if absent.
    pub fn read_one(&self, seq: u64) -> Result<AuditEntry, AuditError> {
        self.backend.read_one(seq)
    }

    /// Reads entries with `from <= seq <= to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, AuditError> {
        self.backend.read_range(from, to)
    }

    /// Queries entries concerning a capsule.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub fn query_capsule(&self, id: CapsuleId, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        self.backend.query_capsule(id, limit)
    }

    /// Queries entries by event tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub fn query_kind(&self, kind: EventKind, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        self.backend.query_kind(kind, limit)
    }

    /// Queries entries in a tick range.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub fn query_tick_range(
        &self,
        from: Tick,
        to: Tick,
        limit: u64,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        self.backend.query_tick_range(from, to, limit)
    }

    /// Best-effort lineage query: entries whose capsule id is in `lineage`.
    ///
    /// The caller walks the registry to produce the lineage id set.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub fn query_lineage(
        &self,
        lineage: &[CapsuleId],
        limit: u64,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut out = Vec::new();
        for id in lineage {
            out.extend(self.backend.query_capsule(*id, limit)?);
        }
        out.sort_by_key(|e| e.seq);
        out.truncate(limit as usize);
        Ok(out)
    }
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("head_seq", &self.head_seq())
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}
