//! Signing-key custody for the runtime's authority domain.
//!
//! The vault holds public verification keys; this module guards the
//! private halves. A [`Keyring`] hands out shared [`Signer`] handles and
//! keeps them cached, so the spawn governor signs a child genesis with the
//! same handle the parent pulses with. Persistence sits behind the
//! [`KeyStore`] seam: in memory for tests, or a directory of 0600 key
//! files for a deployed host.
//!
//! A key is issued exactly once per name. Capsule keys are issued at spawn
//! admission and retired when the capsule is rolled back or terminated;
//! the root authority key lives under [`ROOT_AUTHORITY`] for the life of
//! the process.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use ed25519_dalek::SigningKey;
use thiserror::Error;
use zeroize::Zeroizing;

use super::sign::{SECRET_KEY_SIZE, Signer};

/// Key name reserved for the root authority.
pub const ROOT_AUTHORITY: &str = "root-authority";

/// Errors from key custody.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// I/O failure in a persistent store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No key has been issued under the name.
    #[error("no key issued under: {name}")]
    UnknownKey {
        /// The requested name.
        name: String,
    },

    /// A key was already issued under the name.
    #[error("a key is already issued under: {name}")]
    KeyExists {
        /// The duplicate name.
        name: String,
    },

    /// The name is not a legal key name.
    #[error("illegal key name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Stored bytes do not decode to a secret key.
    #[error("stored key material under {name} is corrupt")]
    CorruptKey {
        /// The affected name.
        name: String,
    },

    /// A key file or directory is readable by group or world.
    #[error("insecure permissions on: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },
}

/// Persistence behind a [`Keyring`].
///
/// Implementations move opaque secret bytes only; naming rules, caching,
/// and signer construction live in the keyring. `save` is first-writer-
/// wins: a second save under the same name must fail with
/// [`KeyringError::KeyExists`].
pub trait KeyStore: Send + Sync {
    /// Loads the secret bytes stored under `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load(&self, name: &str) -> Result<Option<Zeroizing<[u8; SECRET_KEY_SIZE]>>, KeyringError>;

    /// Stores secret bytes under a fresh `name`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::KeyExists`] if the name is taken, or an
    /// error if the bytes cannot be durably stored.
    fn save(&self, name: &str, secret: &[u8; SECRET_KEY_SIZE]) -> Result<(), KeyringError>;

    /// Removes the entry under `name`, reporting whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn remove(&self, name: &str) -> Result<bool, KeyringError>;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Zeroizing<[u8; SECRET_KEY_SIZE]>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, name: &str) -> Result<Option<Zeroizing<[u8; SECRET_KEY_SIZE]>>, KeyringError> {
        Ok(self.entries.lock().unwrap().get(name).cloned())
    }

    fn save(&self, name: &str, secret: &[u8; SECRET_KEY_SIZE]) -> Result<(), KeyringError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(KeyringError::KeyExists {
                name: name.to_string(),
            });
        }
        entries.insert(name.to_string(), Zeroizing::new(*secret));
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<bool, KeyringError> {
        Ok(self.entries.lock().unwrap().remove(name).is_some())
    }
}

/// Directory-backed store: one 0600 file per key inside a 0700 directory.
pub struct DirKeyStore {
    dir: PathBuf,
}

impl DirKeyStore {
    /// Opens (creating if needed) a key directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or carries
    /// group or world access bits.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyringError> {
        use std::os::unix::fs::PermissionsExt;

        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Self::assert_private(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.ed25519"))
    }

    fn assert_private(path: &std::path::Path) -> Result<(), KeyringError> {
        use std::os::unix::fs::PermissionsExt;

        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(KeyringError::InsecurePermissions {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }
}

impl KeyStore for DirKeyStore {
    fn load(&self, name: &str) -> Result<Option<Zeroizing<[u8; SECRET_KEY_SIZE]>>, KeyringError> {
        use std::io::Read;

        let path = self.key_path(name);
        if !path.exists() {
            return Ok(None);
        }
        Self::assert_private(&path)?;

        let mut secret = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        std::fs::File::open(&path)?.read_exact(&mut *secret)?;
        Ok(Some(secret))
    }

    fn save(&self, name: &str, secret: &[u8; SECRET_KEY_SIZE]) -> Result<(), KeyringError> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let path = self.key_path(name);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    KeyringError::KeyExists {
                        name: name.to_string(),
                    }
                } else {
                    KeyringError::Io(e)
                }
            })?;
        file.write_all(secret)?;
        file.sync_all()?;
        Self::assert_private(&path)
    }

    fn remove(&self, name: &str) -> Result<bool, KeyringError> {
        let path = self.key_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }
}

/// Custody of signing keys, front of a [`KeyStore`].
pub struct Keyring {
    store: Box<dyn KeyStore>,
    handles: RwLock<HashMap<String, Arc<Signer>>>,
}

impl Keyring {
    /// Creates a keyring over a volatile store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Box::new(MemoryKeyStore::new()))
    }

    /// Creates a keyring over a key directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened securely.
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self, KeyringError> {
        Ok(Self::with_store(Box::new(DirKeyStore::open(dir)?)))
    }

    /// Creates a keyring over an arbitrary store.
    #[must_use]
    pub fn with_store(store: Box<dyn KeyStore>) -> Self {
        Self {
            store,
            handles: RwLock::new(HashMap::new()),
        }
    }

    // Names become file stems in persistent stores, so anything that
    // could traverse paths is rejected outright. Capsule ids and the
    // root-authority constant always pass.
    fn checked_name(name: &str) -> Result<&str, KeyringError> {
        let legal = !name.is_empty()
            && name.len() <= 128
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if legal {
            Ok(name)
        } else {
            Err(KeyringError::InvalidName {
                name: name.to_string(),
            })
        }
    }

    fn install(&self, name: &str, key: SigningKey) -> Arc<Signer> {
        let handle = Arc::new(Signer::new(key));
        self.handles
            .write()
            .unwrap()
            .insert(name.to_string(), handle.clone());
        handle
    }

    /// Issues a fresh keypair under `name` and returns its signer handle.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::KeyExists`] if a key was already issued
    /// under the name, [`KeyringError::InvalidName`] for an illegal name,
    /// or a store error.
    pub fn issue(&self, name: &str) -> Result<Arc<Signer>, KeyringError> {
        let name = Self::checked_name(name)?;

        let mut rng = rand::thread_rng();
        let key = SigningKey::generate(&mut rng);
        self.store.save(name, &key.to_bytes())?;
        Ok(self.install(name, key))
    }

    /// Returns the signer handle issued under `name`.
    ///
    /// Cached handles are shared; a cold lookup reads the store.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::UnknownKey`] if nothing was issued under
    /// the name, or a store error.
    pub fn signer(&self, name: &str) -> Result<Arc<Signer>, KeyringError> {
        let name = Self::checked_name(name)?;

        if let Some(handle) = self.handles.read().unwrap().get(name) {
            return Ok(handle.clone());
        }

        let secret = self
            .store
            .load(name)?
            .ok_or_else(|| KeyringError::UnknownKey {
                name: name.to_string(),
            })?;
        Ok(self.install(name, SigningKey::from_bytes(&secret)))
    }

    /// Returns true if a key has been issued under `name`.
    #[must_use]
    pub fn is_issued(&self, name: &str) -> bool {
        self.signer(name).is_ok()
    }

    /// Retires the key under `name`, dropping the cached handle and the
    /// stored secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::UnknownKey`] if nothing was issued under
    /// the name, or a store error.
    pub fn retire(&self, name: &str) -> Result<(), KeyringError> {
        let name = Self::checked_name(name)?;

        self.handles.write().unwrap().remove(name);
        if self.store.remove(name)? {
            Ok(())
        } else {
            Err(KeyringError::UnknownKey {
                name: name.to_string(),
            })
        }
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("cached_handles", &self.handles.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn issue_then_sign_round_trips() {
        let keyring = Keyring::in_memory();

        let issued = keyring.issue("capsule-a").unwrap();
        let fetched = keyring.signer("capsule-a").unwrap();

        let signature = issued.sign(b"pulse body");
        assert_eq!(issued.public_key(), fetched.public_key());
        assert!(fetched.verify(b"pulse body", &signature));
    }

    #[test]
    fn issue_is_exactly_once_per_name() {
        let keyring = Keyring::in_memory();

        keyring.issue("capsule-a").unwrap();
        let again = keyring.issue("capsule-a");
        assert!(matches!(again, Err(KeyringError::KeyExists { .. })));
    }

    #[test]
    fn unknown_name_has_no_signer() {
        let keyring = Keyring::in_memory();
        assert!(matches!(
            keyring.signer("never-issued"),
            Err(KeyringError::UnknownKey { .. })
        ));
        assert!(!keyring.is_issued("never-issued"));
    }

    #[test]
    fn retire_drops_handle_and_secret() {
        let keyring = Keyring::in_memory();
        keyring.issue("capsule-a").unwrap();

        keyring.retire("capsule-a").unwrap();
        assert!(!keyring.is_issued("capsule-a"));

        let twice = keyring.retire("capsule-a");
        assert!(matches!(twice, Err(KeyringError::UnknownKey { .. })));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let keyring = Keyring::in_memory();
        for name in ["", "../escape", "a/b", "a b", &"x".repeat(200)] {
            assert!(matches!(
                keyring.issue(name),
                Err(KeyringError::InvalidName { .. })
            ));
        }
        assert!(keyring.issue(ROOT_AUTHORITY).is_ok());
    }

    #[test]
    fn persistent_keys_survive_a_new_keyring() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys");

        let public_key = {
            let keyring = Keyring::persistent(&path).unwrap();
            keyring.issue("capsule-a").unwrap().public_key()
        };

        let reopened = Keyring::persistent(&path).unwrap();
        let signer = reopened.signer("capsule-a").unwrap();
        assert_eq!(signer.public_key(), public_key);
    }

    #[test]
    fn persistent_key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys");
        let keyring = Keyring::persistent(&path).unwrap();
        keyring.issue("capsule-a").unwrap();

        let dir_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        let key_mode = std::fs::metadata(path.join("capsule-a.ed25519"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(key_mode & 0o777, 0o600);
    }

    #[test]
    fn persistent_retire_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys");
        let keyring = Keyring::persistent(&path).unwrap();

        keyring.issue("capsule-a").unwrap();
        keyring.retire("capsule-a").unwrap();
        assert!(!path.join("capsule-a.ed25519").exists());
    }
}
