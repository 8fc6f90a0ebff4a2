//! Ed25519 signing and verification.

use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors from signing and verification operations.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The provided public key bytes are not a valid Ed25519 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The provided signature bytes are malformed.
    #[error("invalid signature encoding: {0}")]
    InvalidSignatureBytes(String),
}

/// Parses a verifying key from raw bytes.
///
/// # Errors
///
/// Returns [`SignerError::InvalidPublicKey`] if the bytes do not decode to a
/// valid curve point.
pub fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, SignerError> {
    let arr: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| SignerError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| SignerError::InvalidPublicKey(e.to_string()))
}

/// Parses a signature from raw bytes.
///
/// # Errors
///
/// Returns [`SignerError::InvalidSignatureBytes`] if the slice is not
/// exactly [`SIGNATURE_SIZE`] bytes.
pub fn parse_signature(bytes: &[u8]) -> Result<Signature, SignerError> {
    let arr: [u8; SIGNATURE_SIZE] = bytes.try_into().map_err(|_| {
        SignerError::InvalidSignatureBytes(format!("expected 64 bytes, got {}", bytes.len()))
    })?;
    Ok(Signature::from_bytes(&arr))
}

/// Verifies a signature over a message.
///
/// Returns `false` for malformed keys or signatures rather than erroring;
/// callers treat any failure as an invalid signature.
#[must_use]
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = parse_verifying_key(public_key) else {
        return false;
    };
    let Ok(sig) = parse_signature(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

/// A signing wrapper over an Ed25519 keypair.
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Creates a signer from a signing key.
    #[must_use]
    pub const fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Generates a signer with a fresh random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Signs a message, returning the raw signature bytes.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Returns the public verification key bytes.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Returns a reference to the underlying signing key.
    #[must_use]
    pub const fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Verifies a signature produced by this signer's keypair.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key(), message, signature)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}
