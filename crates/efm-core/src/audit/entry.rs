//! Audit entry records and the emitter identity.

use serde::{Deserialize, Serialize};

use super::kind::EventKind;
use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::{CanonicalWriter, ContentHash, ContentHasher};

/// Signing domain for audit entries.
pub(crate) const AUDIT_DOMAIN: &str = "efm.audit.v1";

/// Identity of the actor that emitted an audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditWriter {
    /// A runtime component (pipeline stage, governor, sweeper, ...).
    System {
        /// Component name, e.g. `pipeline.reflex`.
        component: String,
    },
    /// A capsule.
    Capsule(CapsuleId),
}

impl AuditWriter {
    /// System writer constructor.
    #[must_use]
    pub fn system(component: impl Into<String>) -> Self {
        Self::System {
            component: component.into(),
        }
    }

    /// Canonical storage form (`system:<component>` or `capsule:<id>`).
    #[must_use]
    pub fn as_wire(&self) -> String {
        match self {
            Self::System { component } => format!("system:{component}"),
            Self::Capsule(id) => format!("capsule:{id}"),
        }
    }

    /// Parses the canonical storage form.
    #[must_use]
    pub fn parse(wire: &str) -> Option<Self> {
        if let Some(component) = wire.strip_prefix("system:") {
            return Some(Self::system(component));
        }
        let id = wire.strip_prefix("capsule:")?;
        id.parse().ok().map(Self::Capsule)
    }
}

impl std::fmt::Display for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_wire())
    }
}

/// An event submitted to the audit chain, before sealing.
///
/// The chain assigns the sequence number, links the previous hash, computes
/// the content hash, and signs on behalf of the writer.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event type tag.
    pub kind: EventKind,

    /// Logical tick at which the event occurred.
    pub tick: Tick,

    /// Who emitted the event.
    pub writer: AuditWriter,

    /// Capsule the event concerns, if any.
    pub capsule_id: Option<CapsuleId>,

    /// Opaque payload bytes (typically JSON).
    pub payload: Vec<u8>,
}

impl AuditEvent {
    /// Creates an event with a JSON payload.
    ///
    /// # Panics
    ///
    /// Never panics: `serde_json::Value` serialization is infallible.
    #[must_use]
    pub fn new(
        kind: EventKind,
        tick: Tick,
        writer: AuditWriter,
        capsule_id: Option<CapsuleId>,
        payload: &serde_json::Value,
    ) -> Self {
        Self {
            kind,
            tick,
            writer,
            capsule_id,
            payload: serde_json::to_vec(payload).expect("JSON value serialization is infallible"),
        }
    }
}

/// A sealed entry in the forensic chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequence number, contiguous from 1.
    pub seq: u64,

    /// Content hash of the previous entry; the genesis sentinel for seq 1.
    pub prev_hash: ContentHash,

    /// Event type tag.
    pub kind: EventKind,

    /// Logical tick of the event.
    pub tick: Tick,

    /// Emitter identity.
    pub writer: AuditWriter,

    /// Capsule the event concerns, if any.
    pub capsule_id: Option<CapsuleId>,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Hash of this entry's content linked to `prev_hash`.
    pub content_hash: ContentHash,

    /// Committer signature over the content hash, when signing is enabled.
    pub signature: Option<Vec<u8>>,
}

impl AuditEntry {
    /// Canonical bytes covered by the content hash.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        Self::canonical_bytes_of(
            self.seq,
            self.kind,
            self.tick,
            &self.writer,
            self.capsule_id,
            &self.payload,
        )
    }

    /// Canonical bytes for the given entry fields.
    #[must_use]
    pub fn canonical_bytes_of(
        seq: u64,
        kind: EventKind,
        tick: Tick,
        writer: &AuditWriter,
        capsule_id: Option<CapsuleId>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut w = CanonicalWriter::new(AUDIT_DOMAIN);
        w.put_u64(seq);
        w.put_str(kind.as_str());
        w.put_u64(tick.value());
        w.put_str(&writer.as_wire());
        match capsule_id {
            Some(id) => {
                let s = id.as_string();
                w.put_opt_bytes(Some(s.as_bytes()));
            },
            None => {
                w.put_opt_bytes(None);
            },
        }
        w.put_bytes(payload);
        w.finish()
    }

    /// Recomputes the content hash this entry should carry.
    #[must_use]
    pub fn expected_content_hash(&self) -> ContentHash {
        ContentHasher::hash_linked(AUDIT_DOMAIN, &self.canonical_bytes(), &self.prev_hash)
    }

    /// Deserializes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GENESIS_PREV_HASH;

    #[test]
    fn writer_wire_round_trip() {
        let system = AuditWriter::system("pipeline.reflex");
        assert_eq!(AuditWriter::parse(&system.as_wire()), Some(system.clone()));

        let capsule = AuditWriter::Capsule(CapsuleId::generate());
        assert_eq!(AuditWriter::parse(&capsule.as_wire()), Some(capsule));

        assert_eq!(AuditWriter::parse("neither:thing"), None);
    }

    #[test]
    fn entry_serde_round_trip() {
        let entry = AuditEntry {
            seq: 1,
            prev_hash: GENESIS_PREV_HASH,
            kind: EventKind::PulseRejected,
            tick: Tick::new(100),
            writer: AuditWriter::system("liveness"),
            capsule_id: Some(CapsuleId::generate()),
            payload: b"{\"reason\":\"GenesisMismatch\"}".to_vec(),
            content_hash: GENESIS_PREV_HASH,
            signature: None,
        };
        let entry = AuditEntry {
            content_hash: entry.expected_content_hash(),
            ..entry
        };

        let json = serde_json::to_string(&entry).unwrap();
        let decoded: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, decoded);
        assert_eq!(decoded.expected_content_hash(), decoded.content_hash);
    }

    #[test]
    fn content_hash_covers_every_field() {
        let base = AuditEntry {
            seq: 3,
            prev_hash: GENESIS_PREV_HASH,
            kind: EventKind::ReflexBlock,
            tick: Tick::new(9),
            writer: AuditWriter::system("pipeline.reflex"),
            capsule_id: None,
            payload: b"x".to_vec(),
            content_hash: GENESIS_PREV_HASH,
            signature: None,
        };

        let mut tampered = base.clone();
        tampered.payload = b"y".to_vec();
        assert_ne!(base.expected_content_hash(), tampered.expected_content_hash());

        let mut reseq = base.clone();
        reseq.seq = 4;
        assert_ne!(base.expected_content_hash(), reseq.expected_content_hash());
    }
}
