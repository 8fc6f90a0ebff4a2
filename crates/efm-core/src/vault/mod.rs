//! Immutable constitutional store.
//!
//! The vault holds what must never change underneath a running swarm: the
//! commandment hash, the root verification key, every capsule's public key
//! and genesis record, and termination tombstones. There is no update and no
//! delete; the only writers are the spawn governor's `register` and
//! `mark_terminated`, both append-only.
//!
//! Reads are constant-time map lookups behind a read lock; registration
//! contention is rare (spawn admission only), so readers are effectively
//! uncontended.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

mod commandments;

pub use commandments::{Commandment, CommandmentId, Commandments};

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::capsule::{CapsuleId, GenesisRecord};
use crate::clock::Tick;
use crate::crypto::{ContentHash, PUBLIC_KEY_SIZE};

/// Errors from vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The capsule id is not registered.
    #[error("unknown capsule id: {id}")]
    IdUnknown {
        /// The unregistered id.
        id: CapsuleId,
    },

    /// The capsule is already terminated.
    #[error("capsule already terminated: {id}")]
    IdAlreadyTerminated {
        /// The terminated id.
        id: CapsuleId,
    },

    /// The capsule id is already registered.
    #[error("capsule already registered: {id}")]
    IdAlreadyRegistered {
        /// The duplicate id.
        id: CapsuleId,
    },

    /// The genesis record's signature does not verify against the signer
    /// key on file.
    #[error("genesis signature invalid for capsule {id}")]
    SignatureInvalid {
        /// The capsule whose genesis failed verification.
        id: CapsuleId,
    },
}

/// A termination tombstone.
///
/// Once a tombstone exists for an id, no pulse from that id is ever
/// accepted again.
#[derive(Debug, Clone)]
pub struct Tombstone {
    /// The terminated capsule.
    pub capsule_id: CapsuleId,

    /// Reason tag recorded at termination.
    pub reason: String,

    /// Tick of termination.
    pub tick: Tick,
}

#[derive(Default)]
struct VaultState {
    keys: HashMap<CapsuleId, [u8; PUBLIC_KEY_SIZE]>,
    genesis: HashMap<CapsuleId, GenesisRecord>,
    tombstones: HashMap<CapsuleId, Tombstone>,
}

/// The immutable constitutional store.
pub struct Vault {
    commandment_hash: ContentHash,
    root_key: [u8; PUBLIC_KEY_SIZE],
    state: RwLock<VaultState>,
}

impl Vault {
    /// Creates a vault with the default commandment set and the given root
    /// verification key.
    #[must_use]
    pub fn new(root_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self::with_commandments(root_key, &Commandments::default())
    }

    /// Creates a vault sealed to a specific commandment set.
    #[must_use]
    pub fn with_commandments(root_key: [u8; PUBLIC_KEY_SIZE], commandments: &Commandments) -> Self {
        Self {
            commandment_hash: commandments.canonical_hash(),
            root_key,
            state: RwLock::new(VaultState::default()),
        }
    }

    /// The sealed commandment hash.
    #[must_use]
    pub const fn commandment_hash(&self) -> ContentHash {
        self.commandment_hash
    }

    /// The root authority verification key.
    #[must_use]
    pub const fn root_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.root_key
    }

    /// Registers a capsule's genesis record and public key.
    ///
    /// Invoked exclusively by the spawn governor. The genesis signature is
    /// verified against the parent's registered key, or against the root
    /// key when the record has no parent.
    ///
    /// # Errors
    ///
    /// - [`VaultError::IdAlreadyRegistered`] if the id exists.
    /// - [`VaultError::IdUnknown`] if the parent is not registered.
    /// - [`VaultError::SignatureInvalid`] if the genesis signature fails.
    pub fn register(
        &self,
        genesis: GenesisRecord,
        public_key: [u8; PUBLIC_KEY_SIZE],
    ) -> Result<ContentHash, VaultError> {
        let mut state = self.state.write().unwrap();

        let id = genesis.capsule_id;
        if state.genesis.contains_key(&id) {
            return Err(VaultError::IdAlreadyRegistered { id });
        }

        let signer_key = match genesis.parent_id {
            Some(parent) => *state
                .keys
                .get(&parent)
                .ok_or(VaultError::IdUnknown { id: parent })?,
            None => self.root_key,
        };

        if !genesis.verify(&signer_key) {
            return Err(VaultError::SignatureInvalid { id });
        }

        let hash = genesis.genesis_hash();
        state.keys.insert(id, public_key);
        state.genesis.insert(id, genesis);
        Ok(hash)
    }

    /// Records a termination tombstone for a registered capsule.
    ///
    /// Append-only: a second termination of the same id is an error.
    ///
    /// # Errors
    ///
    /// - [`VaultError::IdUnknown`] if the id was never registered.
    /// - [`VaultError::IdAlreadyTerminated`] if a tombstone exists.
    pub fn mark_terminated(
        &self,
        id: CapsuleId,
        reason: impl Into<String>,
        tick: Tick,
    ) -> Result<(), VaultError> {
        let mut state = self.state.write().unwrap();

        if !state.genesis.contains_key(&id) {
            return Err(VaultError::IdUnknown { id });
        }
        if state.tombstones.contains_key(&id) {
            return Err(VaultError::IdAlreadyTerminated { id });
        }

        state.tombstones.insert(
            id,
            Tombstone {
                capsule_id: id,
                reason: reason.into(),
                tick,
            },
        );
        Ok(())
    }

    /// Looks up a capsule's public verification key.
    #[must_use]
    pub fn public_key(&self, id: CapsuleId) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.state.read().unwrap().keys.get(&id).copied()
    }

    /// Looks up a capsule's genesis record.
    #[must_use]
    pub fn genesis(&self, id: CapsuleId) -> Option<GenesisRecord> {
        self.state.read().unwrap().genesis.get(&id).cloned()
    }

    /// Looks up a capsule's stable genesis hash.
    #[must_use]
    pub fn genesis_hash(&self, id: CapsuleId) -> Option<ContentHash> {
        self.state
            .read()
            .unwrap()
            .genesis
            .get(&id)
            .map(GenesisRecord::genesis_hash)
    }

    /// Returns the tombstone for a terminated capsule, if any.
    #[must_use]
    pub fn tombstone(&self, id: CapsuleId) -> Option<Tombstone> {
        self.state.read().unwrap().tombstones.get(&id).cloned()
    }

    /// Returns true if the capsule has a termination tombstone.
    #[must_use]
    pub fn is_terminated(&self, id: CapsuleId) -> bool {
        self.state.read().unwrap().tombstones.contains_key(&id)
    }

    /// Returns true if the capsule is registered.
    #[must_use]
    pub fn is_registered(&self, id: CapsuleId) -> bool {
        self.state.read().unwrap().genesis.contains_key(&id)
    }

    /// Number of registered capsules (terminated ones included).
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.state.read().unwrap().genesis.len()
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("commandment_hash", &self.commandment_hash)
            .field("registered", &self.registered_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentHasher, Signer};

    fn root_genesis(id: CapsuleId, root: &Signer) -> GenesisRecord {
        GenesisRecord::create(
            id,
            None,
            Tick::new(1),
            0,
            ContentHasher::hash("efm.task", b"root"),
            Commandments::default().canonical_hash(),
            root,
        )
    }

    #[test]
    fn register_and_read_back() {
        let root = Signer::generate();
        let vault = Vault::new(root.public_key());

        let capsule_signer = Signer::generate();
        let id = CapsuleId::generate();
        let genesis = root_genesis(id, &root);
        let expected_hash = genesis.genesis_hash();

        let hash = vault.register(genesis, capsule_signer.public_key()).unwrap();
        assert_eq!(hash, expected_hash);
        assert_eq!(vault.genesis_hash(id), Some(expected_hash));
        assert_eq!(vault.public_key(id), Some(capsule_signer.public_key()));
        assert!(!vault.is_terminated(id));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let root = Signer::generate();
        let vault = Vault::new(root.public_key());

        let id = CapsuleId::generate();
        let genesis = root_genesis(id, &root);
        vault
            .register(genesis.clone(), Signer::generate().public_key())
            .unwrap();

        let result = vault.register(genesis, Signer::generate().public_key());
        assert!(matches!(result, Err(VaultError::IdAlreadyRegistered { .. })));
    }

    #[test]
    fn bad_genesis_signature_rejected() {
        let root = Signer::generate();
        let impostor = Signer::generate();
        let vault = Vault::new(root.public_key());

        let genesis = root_genesis(CapsuleId::generate(), &impostor);
        let result = vault.register(genesis, Signer::generate().public_key());
        assert!(matches!(result, Err(VaultError::SignatureInvalid { .. })));
    }

    #[test]
    fn child_registration_requires_registered_parent() {
        let root = Signer::generate();
        let vault = Vault::new(root.public_key());

        let parent_signer = Signer::generate();
        let parent_id = CapsuleId::generate();
        vault
            .register(root_genesis(parent_id, &root), parent_signer.public_key())
            .unwrap();

        let child = GenesisRecord::create(
            CapsuleId::generate(),
            Some(parent_id),
            Tick::new(10),
            1,
            ContentHasher::hash("efm.task", b"child"),
            Commandments::default().canonical_hash(),
            &parent_signer,
        );
        assert!(vault.register(child, Signer::generate().public_key()).is_ok());

        let orphan = GenesisRecord::create(
            CapsuleId::generate(),
            Some(CapsuleId::generate()),
            Tick::new(10),
            1,
            ContentHasher::hash("efm.task", b"orphan"),
            Commandments::default().canonical_hash(),
            &parent_signer,
        );
        let result = vault.register(orphan, Signer::generate().public_key());
        assert!(matches!(result, Err(VaultError::IdUnknown { .. })));
    }

    #[test]
    fn termination_is_append_only() {
        let root = Signer::generate();
        let vault = Vault::new(root.public_key());

        let id = CapsuleId::generate();
        vault
            .register(root_genesis(id, &root), Signer::generate().public_key())
            .unwrap();

        vault.mark_terminated(id, "liveness", Tick::new(50)).unwrap();
        assert!(vault.is_terminated(id));
        assert_eq!(vault.tombstone(id).unwrap().reason, "liveness");

        let again = vault.mark_terminated(id, "again", Tick::new(51));
        assert!(matches!(again, Err(VaultError::IdAlreadyTerminated { .. })));

        let unknown = vault.mark_terminated(CapsuleId::generate(), "x", Tick::new(52));
        assert!(matches!(unknown, Err(VaultError::IdUnknown { .. })));
    }
}
