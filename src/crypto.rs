// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `CryptoService`: keypair creation, loading and removal on
//! top of one or more [`KeyStore`]s.

use crate::error::{self, Result};
use crate::keystore::KeyStore;
use crate::schema::key::Key;
use crate::sign::{self, Sign};
use log::debug;
use ring::rand::SystemRandom;
use snafu::ResultExt;

pub use crate::keystore::PassphraseRetriever;
pub use crate::sign::KeyAlgorithm;

/// Creates, loads and removes signing keys for the roles of one GUN.
///
/// Key stores are consulted in order of preference; new keys are placed in
/// the first store. Unlocked private keys are cached inside the stores for
/// the lifetime of the process, so a passphrase is requested at most once
/// per key.
#[derive(Debug)]
pub struct CryptoService {
    gun: String,
    key_stores: Vec<Box<dyn KeyStore>>,
    rng: SystemRandom,
}

impl CryptoService {
    /// A crypto service for `gun` over the given stores.
    pub fn new(gun: &str, key_stores: Vec<Box<dyn KeyStore>>) -> Self {
        Self {
            gun: gun.to_owned(),
            key_stores,
            rng: SystemRandom::new(),
        }
    }

    /// The GUN this service serves.
    pub fn gun(&self) -> &str {
        &self.gun
    }

    /// Generates a keypair for `role`, stores the private half, and returns
    /// the public half.
    pub fn create(&self, role: &str, algorithm: KeyAlgorithm) -> Result<Key> {
        let pkcs8 = sign::generate(algorithm, &self.rng)?;
        let pair = sign::parse_keypair(algorithm, &pkcs8)?;
        let key = pair.tuf_key();
        let key_id = key.key_id().context(error::SchemaSnafu)?;
        let key_id_hex = hex::encode(&key_id);
        debug!("generated {} key {} for role {}", algorithm, key_id_hex, role);

        let store = self
            .key_stores
            .first()
            .ok_or(crate::error::Error::KeyUnrecognized)?;
        store.add_key(&key_id_hex, role, algorithm, &pkcs8)?;
        Ok(key)
    }

    /// Loads the private key called `key_id` from the first store that
    /// holds it, returning the keypair and the role it was stored for.
    pub fn get_private_key(&self, key_id: &str) -> Result<(Box<dyn Sign>, String)> {
        let mut last_err = None;
        for store in &self.key_stores {
            match store.get_key(key_id) {
                Ok(found) => return Ok(found),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(crate::error::Error::KeyNotFound {
            key_id: key_id.to_owned(),
        }))
    }

    /// Loads the raw PKCS#8 material of `key_id` from the first store that
    /// holds it.
    pub fn get_key_material(&self, key_id: &str) -> Result<(KeyAlgorithm, Vec<u8>, String)> {
        let mut last_err = None;
        for store in &self.key_stores {
            match store.get_key_material(key_id) {
                Ok(found) => return Ok(found),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(crate::error::Error::KeyNotFound {
            key_id: key_id.to_owned(),
        }))
    }

    /// The public half of a stored private key, or `None` if the key cannot
    /// be found or unlocked.
    pub fn get_key(&self, key_id: &str) -> Option<Key> {
        self.get_private_key(key_id)
            .ok()
            .map(|(pair, _)| pair.tuf_key())
    }

    /// The IDs of every stored key bound to `role`.
    pub fn list_keys(&self, role: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for store in &self.key_stores {
            for (key_id, key_role) in store.list_keys() {
                if key_role == role && !ids.contains(&key_id) {
                    ids.push(key_id);
                }
            }
        }
        ids
    }

    /// Removes `key_id` from every store.
    pub fn remove_key(&self, key_id: &str) -> Result<()> {
        for store in &self.key_stores {
            store.remove_key(key_id)?;
        }
        Ok(())
    }
}
