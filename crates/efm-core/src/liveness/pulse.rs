//! Signed liveness pulses.

use serde::{Deserialize, Serialize};

use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::{CanonicalWriter, ContentHash, Signer, verify_signature};

/// Signing domain for pulses.
const PULSE_DOMAIN: &str = "efm.pulse.v1";

/// A periodic signed liveness message from a capsule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Claimed capsule id.
    pub capsule_id: CapsuleId,

    /// Tick at which the pulse was emitted.
    pub tick: Tick,

    /// The capsule's genesis hash; must match the vault.
    pub genesis_hash: ContentHash,

    /// Self-reported composite health.
    pub health_composite: f64,

    /// Hash of the capsule's current state.
    pub state_hash: ContentHash,

    /// Signature over the canonical bytes.
    pub signature: Vec<u8>,
}

impl Pulse {
    /// Builds and signs a pulse.
    #[must_use]
    pub fn create(
        capsule_id: CapsuleId,
        tick: Tick,
        genesis_hash: ContentHash,
        health_composite: f64,
        state_hash: ContentHash,
        signer: &Signer,
    ) -> Self {
        let mut pulse = Self {
            capsule_id,
            tick,
            genesis_hash,
            health_composite,
            state_hash,
            signature: Vec::new(),
        };
        pulse.signature = signer.sign(&pulse.signing_bytes());
        pulse
    }

    /// Canonical bytes covered by the signature.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new(PULSE_DOMAIN);
        w.put_str(&self.capsule_id.as_string());
        w.put_u64(self.tick.value());
        w.put_bytes(self.genesis_hash.as_bytes());
        w.put_f64(self.health_composite);
        w.put_bytes(self.state_hash.as_bytes());
        w.finish()
    }

    /// Verifies the pulse signature against a public key.
    #[must_use]
    pub fn verify(&self, public_key: &[u8]) -> bool {
        verify_signature(public_key, &self.signing_bytes(), &self.signature)
    }
}
