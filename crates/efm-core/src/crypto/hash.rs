//! SHA-256 content hashing and hash-chain linking.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of a content hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Sentinel previous-hash used by the genesis entry of a chain.
pub const GENESIS_PREV_HASH: ContentHash = ContentHash([0u8; HASH_SIZE]);

/// A SHA-256 content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// Wraps raw hash bytes.
    #[must_use]
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Returns the hash as an owned byte vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Returns true if this is the all-zero genesis sentinel.
    #[must_use]
    pub fn is_genesis_sentinel(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Parses a hash from a byte slice.
    ///
    /// Returns `None` if the slice is not exactly [`HASH_SIZE`] bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Stateless hashing helpers.
///
/// All hashes are domain-separated: the domain prefix is hashed first so
/// that, for example, a pulse body and an audit payload with identical bytes
/// can never collide.
pub struct ContentHasher;

impl ContentHasher {
    /// Hashes arbitrary content under a domain prefix.
    #[must_use]
    pub fn hash(domain: &str, content: &[u8]) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update([0x1f]);
        hasher.update(content);
        ContentHash(hasher.finalize().into())
    }

    /// Hashes an entry's content together with the previous entry's hash,
    /// producing the chain-link hash.
    #[must_use]
    pub fn hash_linked(domain: &str, content: &[u8], prev: &ContentHash) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update([0x1f]);
        hasher.update(prev.as_bytes());
        hasher.update(content);
        ContentHash(hasher.finalize().into())
    }
}
