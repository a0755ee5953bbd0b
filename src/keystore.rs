// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the key-store capability: named, role-tagged private keys that
//! are encrypted at rest. The engine only depends on the operation set
//! (`list`/`add`/`get`/`remove`); the filesystem layout and sealing scheme
//! live entirely in this module.

use crate::error::{self, Error, Result};
use crate::schema::decoded::{Base64, Decoded};
use crate::sign::{parse_keypair, KeyAlgorithm, Sign};
use log::debug;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// How many times the retriever is asked for a passphrase before the
/// operation fails with `AttemptsExceeded`.
const MAX_ATTEMPTS: u32 = 3;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;

/// The injected passphrase callback.
///
/// Called as `(key_name, alias, create_new, attempt)` where `alias` is the
/// role the key belongs to and `create_new` distinguishes choosing a new
/// passphrase from unlocking an existing key. It returns the passphrase and
/// a give-up flag; giving up translates to [`Error::PasswordInvalid`], and
/// exhausting the attempt budget to [`Error::AttemptsExceeded`].
pub type PassphraseRetriever = Box<
    dyn Fn(&str, &str, bool, u32) -> std::result::Result<(String, bool), String> + Send + Sync,
>;

/// The key-store capability: private keys tagged with the role they sign.
pub trait KeyStore: fmt::Debug + Send + Sync {
    /// Stores a private key (PKCS#8) under `key_id` for `role`.
    fn add_key(&self, key_id: &str, role: &str, algorithm: KeyAlgorithm, pkcs8: &[u8])
        -> Result<()>;

    /// Loads the private key called `key_id`, returning the keypair and the
    /// role it was stored for.
    fn get_key(&self, key_id: &str) -> Result<(Box<dyn Sign>, String)>;

    /// Loads the raw PKCS#8 form of `key_id`, returning the algorithm, the
    /// key material, and the role it was stored for. Needed where the key
    /// feeds a non-ring consumer, such as certificate generation.
    fn get_key_material(&self, key_id: &str) -> Result<(KeyAlgorithm, Vec<u8>, String)>;

    /// Lists `(key_id, role)` for every key held.
    fn list_keys(&self) -> Vec<(String, String)>;

    /// Removes the key called `key_id`. Removing an absent key is not an
    /// error.
    fn remove_key(&self, key_id: &str) -> Result<()>;
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The at-rest form of a stored key: cleartext role/algorithm so keys can
/// be listed without a passphrase, sealed key material.
#[derive(Debug, Deserialize, Serialize)]
struct KeyEnvelope {
    role: String,
    algorithm: KeyAlgorithm,
    iterations: u32,
    salt: Decoded<Base64>,
    nonce: Decoded<Base64>,
    ciphertext: Decoded<Base64>,
}

/// A filesystem key store rooted at `<dir>`. Keys for the root role live at
/// `<dir>/<keyid>.key`; keys belonging to a GUN live at
/// `<dir>/<gun>/<keyid>.key`. Key material is sealed with AES-256-GCM under
/// a PBKDF2-derived key; the passphrase comes from the injected retriever
/// and is requested at most once per key per process thanks to an unlocked
/// cache.
pub struct FilesystemKeyStore {
    keys_dir: PathBuf,
    gun: String,
    retriever: PassphraseRetriever,
    // key_id -> (role, algorithm, unsealed pkcs8)
    cache: RwLock<HashMap<String, (String, KeyAlgorithm, Vec<u8>)>>,
    rng: SystemRandom,
}

impl fmt::Debug for FilesystemKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemKeyStore")
            .field("keys_dir", &self.keys_dir)
            .field("gun", &self.gun)
            .finish()
    }
}

impl FilesystemKeyStore {
    /// Opens (creating if needed) the key store under
    /// `<base_dir>/private/tuf_keys` for the given GUN.
    pub fn new<P: AsRef<Path>>(
        base_dir: P,
        gun: &str,
        retriever: PassphraseRetriever,
    ) -> Result<Self> {
        let keys_dir = base_dir.as_ref().join("private").join("tuf_keys");
        std::fs::create_dir_all(&keys_dir).context(error::DirCreateSnafu { path: &keys_dir })?;
        Ok(Self {
            keys_dir,
            gun: gun.to_owned(),
            retriever,
            cache: RwLock::new(HashMap::new()),
            rng: SystemRandom::new(),
        })
    }

    fn key_path(&self, key_id: &str, role: &str) -> PathBuf {
        // Root keys are shared across GUNs and live at the top level.
        if role == crate::schema::CANONICAL_ROOT_ROLE {
            self.keys_dir.join(format!("{key_id}.key"))
        } else {
            self.keys_dir.join(&self.gun).join(format!("{key_id}.key"))
        }
    }

    fn find_envelope(&self, key_id: &str) -> Result<KeyEnvelope> {
        let candidates = [
            self.keys_dir.join(&self.gun).join(format!("{key_id}.key")),
            self.keys_dir.join(format!("{key_id}.key")),
        ];
        for path in &candidates {
            match std::fs::read(path) {
                Ok(data) => {
                    return serde_json::from_slice(&data).context(error::ParseMetadataSnafu {
                        role: format!("key {key_id}"),
                    })
                }
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err).context(error::FileReadSnafu { path }),
            }
        }
        error::KeyNotFoundSnafu { key_id }.fail()
    }

    fn retrieve_passphrase(&self, key_id: &str, role: &str, create_new: bool, attempt: u32)
        -> Result<String> {
        let (passphrase, give_up) = (self.retriever)(key_id, role, create_new, attempt)
            .map_err(|_| Error::PasswordInvalid)?;
        ensure!(!give_up, error::PasswordInvalidSnafu);
        Ok(passphrase)
    }

    fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<LessSafeKey> {
        let mut key_bytes = [0u8; 32];
        let iterations = NonZeroU32::new(iterations).context(error::KeyUnrecognizedSnafu)?;
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase.as_bytes(),
            &mut key_bytes,
        );
        let unbound =
            UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| Error::KeyUnrecognized)?;
        Ok(LessSafeKey::new(unbound))
    }

    fn seal(&self, passphrase: &str, pkcs8: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut salt = [0u8; SALT_LEN];
        self.rng.fill(&mut salt).context(error::SignSnafu)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).context(error::SignSnafu)?;

        let key = Self::derive_key(passphrase, &salt, PBKDF2_ITERATIONS)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = pkcs8.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .context(error::SignSnafu)?;
        Ok((salt.to_vec(), nonce_bytes.to_vec(), in_out))
    }

    fn open(envelope: &KeyEnvelope, passphrase: &str) -> Option<Vec<u8>> {
        let key = Self::derive_key(passphrase, &envelope.salt, envelope.iterations).ok()?;
        let nonce_bytes: [u8; NONCE_LEN] = envelope.nonce.as_ref().try_into().ok()?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = envelope.ciphertext.to_vec();
        let plaintext = key.open_in_place(nonce, Aad::empty(), &mut in_out).ok()?;
        Some(plaintext.to_vec())
    }

    /// The unsealed form of a key, from the unlocked cache or by prompting
    /// for the passphrase.
    fn unlocked(&self, key_id: &str) -> Result<(String, KeyAlgorithm, Vec<u8>)> {
        if let Some(found) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
            .cloned()
        {
            return Ok(found);
        }

        let envelope = self.find_envelope(key_id)?;
        for attempt in 1..=MAX_ATTEMPTS {
            let passphrase = self.retrieve_passphrase(key_id, &envelope.role, false, attempt)?;
            if let Some(pkcs8) = Self::open(&envelope, &passphrase) {
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        key_id.to_owned(),
                        (envelope.role.clone(), envelope.algorithm, pkcs8.clone()),
                    );
                return Ok((envelope.role, envelope.algorithm, pkcs8));
            }
            debug!("passphrase attempt {} for key {} failed", attempt, key_id);
        }
        error::AttemptsExceededSnafu.fail()
    }
}

impl KeyStore for FilesystemKeyStore {
    fn add_key(
        &self,
        key_id: &str,
        role: &str,
        algorithm: KeyAlgorithm,
        pkcs8: &[u8],
    ) -> Result<()> {
        let passphrase = self.retrieve_passphrase(key_id, role, true, 1)?;
        let (salt, nonce, ciphertext) = self.seal(&passphrase, pkcs8)?;
        let envelope = KeyEnvelope {
            role: role.to_owned(),
            algorithm,
            iterations: PBKDF2_ITERATIONS,
            salt: salt.into(),
            nonce: nonce.into(),
            ciphertext: ciphertext.into(),
        };

        let path = self.key_path(key_id, role);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(error::DirCreateSnafu { path: parent })?;
        }
        let data = serde_json::to_vec_pretty(&envelope).context(error::JsonSerializationSnafu {
            what: "key envelope",
        })?;
        std::fs::write(&path, data).context(error::FileWriteSnafu { path })?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key_id.to_owned(),
                (role.to_owned(), algorithm, pkcs8.to_vec()),
            );
        Ok(())
    }

    fn get_key(&self, key_id: &str) -> Result<(Box<dyn Sign>, String)> {
        let (role, algorithm, pkcs8) = self.unlocked(key_id)?;
        Ok((parse_keypair(algorithm, &pkcs8)?, role))
    }

    fn get_key_material(&self, key_id: &str) -> Result<(KeyAlgorithm, Vec<u8>, String)> {
        let (role, algorithm, pkcs8) = self.unlocked(key_id)?;
        Ok((algorithm, pkcs8, role))
    }

    fn list_keys(&self) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for dir in [self.keys_dir.clone(), self.keys_dir.join(&self.gun)] {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "key") {
                    continue;
                }
                let Some(key_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(data) = std::fs::read(&path) {
                    if let Ok(envelope) = serde_json::from_slice::<KeyEnvelope>(&data) {
                        found.push((key_id.to_owned(), envelope.role));
                    }
                }
            }
        }
        found
    }

    fn remove_key(&self, key_id: &str) -> Result<()> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key_id);
        for path in [
            self.keys_dir.join(&self.gun).join(format!("{key_id}.key")),
            self.keys_dir.join(format!("{key_id}.key")),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed key file '{}'", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err).context(error::FileRemoveSnafu { path }),
            }
        }
        Ok(())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// An in-memory key store with no passphrase protection, for tests and
/// ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, (String, KeyAlgorithm, Vec<u8>)>>,
}

impl MemoryKeyStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn add_key(
        &self,
        key_id: &str,
        role: &str,
        algorithm: KeyAlgorithm,
        pkcs8: &[u8],
    ) -> Result<()> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key_id.to_owned(),
                (role.to_owned(), algorithm, pkcs8.to_vec()),
            );
        Ok(())
    }

    fn get_key(&self, key_id: &str) -> Result<(Box<dyn Sign>, String)> {
        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let (role, algorithm, pkcs8) = guard
            .get(key_id)
            .context(error::KeyNotFoundSnafu { key_id })?;
        Ok((parse_keypair(*algorithm, pkcs8)?, role.clone()))
    }

    fn get_key_material(&self, key_id: &str) -> Result<(KeyAlgorithm, Vec<u8>, String)> {
        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let (role, algorithm, pkcs8) = guard
            .get(key_id)
            .context(error::KeyNotFoundSnafu { key_id })?;
        Ok((*algorithm, pkcs8.clone(), role.clone()))
    }

    fn list_keys(&self) -> Vec<(String, String)> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, (role, _, _))| (id.clone(), role.clone()))
            .collect()
    }

    fn remove_key(&self, key_id: &str) -> Result<()> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key_id);
        Ok(())
    }
}
