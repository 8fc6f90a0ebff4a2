//! Signed swarm messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::{CanonicalWriter, ContentHash, Signer, verify_signature};

/// Signing domain for messages.
const MESSAGE_DOMAIN: &str = "efm.message.v1";

/// Highest message priority.
pub const MAX_PRIORITY: u8 = 9;

/// Stable message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// A single capsule.
    Capsule(CapsuleId),
    /// Every eligible capsule.
    Broadcast,
}

/// Delivery guarantee requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// One attempt, no retries.
    BestEffort,
    /// Bounded retries with exponential backoff.
    AtLeastOnce,
    /// At-least-once plus receiver-side dedup by message id.
    ExactlyOnce,
}

/// A routed swarm message.
///
/// The signature covers the immutable core (id, sender, recipient, kind,
/// payload, tick, priority, genesis hash). TTL, hop count, and route are
/// mutated by the router on fan-out and are excluded, so a clone still
/// verifies at its receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id (dedup key).
    pub id: MessageId,

    /// Sending capsule.
    pub sender: CapsuleId,

    /// Destination.
    pub recipient: Recipient,

    /// Message type tag.
    pub kind: String,

    /// Opaque payload.
    pub payload: Vec<u8>,

    /// Tick of emission.
    pub tick: Tick,

    /// Remaining time to live, in router hops.
    pub ttl: u32,

    /// Priority, 0 through 9; 9 is serviced first.
    pub priority: u8,

    /// Sender's genesis hash; must match the vault.
    pub sender_genesis: ContentHash,

    /// Requested delivery guarantee.
    pub guarantee: DeliveryGuarantee,

    /// Signature over the immutable core.
    pub signature: Vec<u8>,

    /// Hops taken so far.
    pub hop_count: u32,

    /// Capsules the message has passed through.
    pub route: Vec<CapsuleId>,
}

impl Message {
    /// Builds and signs a message.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        sender: CapsuleId,
        recipient: Recipient,
        kind: impl Into<String>,
        payload: Vec<u8>,
        tick: Tick,
        ttl: u32,
        priority: u8,
        sender_genesis: ContentHash,
        guarantee: DeliveryGuarantee,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            id: MessageId::generate(),
            sender,
            recipient,
            kind: kind.into(),
            payload,
            tick,
            ttl,
            priority: priority.min(MAX_PRIORITY),
            sender_genesis,
            guarantee,
            signature: Vec::new(),
            hop_count: 0,
            route: Vec::new(),
        };
        message.signature = signer.sign(&message.signing_bytes());
        message
    }

    /// Canonical bytes covered by the signature.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new(MESSAGE_DOMAIN);
        w.put_str(&self.id.to_string());
        w.put_str(&self.sender.as_string());
        match self.recipient {
            Recipient::Capsule(id) => {
                let s = id.as_string();
                w.put_opt_bytes(Some(s.as_bytes()));
            },
            Recipient::Broadcast => {
                w.put_opt_bytes(None);
            },
        }
        w.put_str(&self.kind);
        w.put_bytes(&self.payload);
        w.put_u64(self.tick.value());
        w.put_u64(u64::from(self.priority));
        w.put_bytes(self.sender_genesis.as_bytes());
        w.finish()
    }

    /// Verifies the signature against the sender's public key.
    #[must_use]
    pub fn verify(&self, public_key: &[u8]) -> bool {
        verify_signature(public_key, &self.signing_bytes(), &self.signature)
    }

    /// Produces the fan-out clone delivered to one broadcast recipient.
    #[must_use]
    pub fn fan_out_clone(&self, via: CapsuleId) -> Self {
        let mut clone = self.clone();
        clone.ttl = clone.ttl.saturating_sub(1);
        clone.hop_count += 1;
        clone.route.push(via);
        clone
    }
}
