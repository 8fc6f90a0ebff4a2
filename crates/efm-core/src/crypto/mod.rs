//! Cryptographic primitives for the EFM runtime.
//!
//! This module provides the hash-chain and signature primitives used by the
//! forensic audit chain, the vault, pulses, and the message bus:
//!
//! - **SHA-256 hashing**: content hashes and hash-chain links
//! - **Ed25519 signatures**: authentication of pulses, messages, genesis
//!   records, and audit writers
//! - **Key custody**: the keyring issuing and guarding private keys whose
//!   public halves the vault registers
//!
//! # Hash chain
//!
//! Every audit entry carries a hash of its content and the hash of the
//! previous entry, forming an immutable chain. The genesis entry links to a
//! fixed all-zero sentinel. Any tampering with committed history breaks the
//! chain at the tampered entry.
//!
//! # Signatures
//!
//! Signatures cover the canonical encoding of a record (excluding the
//! signature field itself). Canonical encodings are length-prefixed and
//! domain-separated so that two record types can never produce the same
//! signing bytes.

mod canonical;
mod hash;
mod keys;
mod sign;

pub use canonical::CanonicalWriter;
pub use hash::{ContentHash, ContentHasher, GENESIS_PREV_HASH, HASH_SIZE};
pub use keys::{DirKeyStore, KeyStore, Keyring, KeyringError, MemoryKeyStore, ROOT_AUTHORITY};
pub use sign::{
    PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE, Signer, SignerError, parse_signature,
    parse_verifying_key, verify_signature,
};
