// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-process stand-in for the remote trust server: it stores pushed
//! metadata, hands out server-managed public keys, signs a fresh timestamp
//! on every fetch, and (optionally) signs snapshots the way a server
//! managing the snapshot key does.

use sigil::schema::key::Key;
use sigil::schema::{RoleKeys, Root, Signed, Snapshot, Targets};
use sigil::{
    default_expires, CryptoService, Error, KeyAlgorithm, KeyDb, MemoryKeyStore, MetadataStore,
    RemoteStore, Repo, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct TestServer {
    state: Mutex<ServerState>,
}

/// A cloneable handle so several clients can talk to one [`TestServer`].
#[derive(Debug, Clone)]
pub struct SharedServer(pub Arc<TestServer>);

impl MetadataStore for SharedServer {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        self.0.get_meta(role, max_size)
    }

    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()> {
        self.0.set_meta(role, data)
    }

    fn set_multi_meta(&self, metas: &HashMap<String, Vec<u8>>) -> Result<()> {
        self.0.set_multi_meta(metas)
    }
}

impl RemoteStore for SharedServer {
    fn get_key(&self, role: &str) -> Result<Key> {
        self.0.get_key(role)
    }
}

struct ServerState {
    metas: HashMap<String, Vec<u8>>,
    crypto: CryptoService,
    handed_out: HashMap<String, Key>,
    manages_snapshot: bool,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer").finish()
    }
}

impl TestServer {
    pub fn new(manages_snapshot: bool) -> Self {
        Self {
            state: Mutex::new(ServerState {
                metas: HashMap::new(),
                crypto: CryptoService::new("test-server", vec![Box::new(MemoryKeyStore::new())]),
                handed_out: HashMap::new(),
                manages_snapshot,
            }),
        }
    }

    /// The currently stored bytes for a role, for assertions.
    pub fn stored(&self, role: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().metas.get(role).cloned()
    }

    /// Every stored role name, for assertions.
    pub fn stored_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.state.lock().unwrap().metas.keys().cloned().collect();
        roles.sort();
        roles
    }
}

impl ServerState {
    /// Builds and signs a fresh timestamp over the stored snapshot.
    fn signed_timestamp(&self) -> Result<Vec<u8>> {
        let snapshot_bytes = self
            .metas
            .get("snapshot")
            .ok_or_else(|| Error::MetaNotFound {
                role: "snapshot".to_owned(),
            })?;
        let snapshot: Signed<Snapshot> =
            serde_json::from_slice(snapshot_bytes).expect("stored snapshot parses");

        let ts_key = self
            .handed_out
            .get("timestamp")
            .expect("timestamp key was handed out")
            .clone();
        let mut keydb = KeyDb::new();
        let keyid = keydb.add_key(ts_key).expect("timestamp key is valid");
        keydb
            .add_role("timestamp", RoleKeys::new(vec![keyid], 1))
            .expect("timestamp role is valid");

        let mut repo = Repo::new(keydb);
        repo.set_snapshot(snapshot);
        repo.init_timestamp()?;
        repo.sign_timestamp(
            default_expires(sigil::schema::RoleType::Timestamp),
            &self.crypto,
        )
    }

    /// Rebuilds and signs the snapshot from the stored root and targets
    /// roles, as a snapshot-managing server does after each push.
    fn regenerate_snapshot(&mut self) -> Result<()> {
        let root_bytes = match self.metas.get("root") {
            Some(bytes) => bytes.clone(),
            None => return Ok(()),
        };
        let root: Signed<Root> = serde_json::from_slice(&root_bytes).expect("stored root parses");

        let mut repo = Repo::new(KeyDb::new());
        repo.set_root(root)?;
        let mut roles: Vec<String> = self
            .metas
            .keys()
            .filter(|role| role.as_str() == "targets" || role.starts_with("targets/"))
            .cloned()
            .collect();
        // parents first, so delegation records exist when children load
        roles.sort();
        for role in roles {
            let targets: Signed<Targets> =
                serde_json::from_slice(&self.metas[&role]).expect("stored targets parse");
            repo.set_targets(&role, targets)?;
        }
        repo.init_snapshot()?;
        let bytes = repo.sign_snapshot(
            default_expires(sigil::schema::RoleType::Snapshot),
            &self.crypto,
        )?;
        self.metas.insert("snapshot".to_owned(), bytes);
        Ok(())
    }
}

impl MetadataStore for TestServer {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let bytes = if role == "timestamp" {
            state.signed_timestamp()?
        } else {
            state
                .metas
                .get(role)
                .cloned()
                .ok_or_else(|| Error::MetaNotFound {
                    role: role.to_owned(),
                })?
        };
        assert!(bytes.len() as u64 <= max_size, "served blob exceeds cap");
        Ok(bytes)
    }

    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()> {
        self.set_multi_meta(&HashMap::from([(role.to_owned(), data.to_vec())]))
    }

    fn set_multi_meta(&self, metas: &HashMap<String, Vec<u8>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (role, data) in metas {
            state.metas.insert(role.clone(), data.clone());
        }
        if state.manages_snapshot && !metas.contains_key("snapshot") {
            state.regenerate_snapshot()?;
        }
        Ok(())
    }
}

impl RemoteStore for TestServer {
    fn get_key(&self, role: &str) -> Result<Key> {
        let mut state = self.state.lock().unwrap();
        let serves_role = role == "timestamp" || (role == "snapshot" && state.manages_snapshot);
        if !serves_role {
            return Err(Error::MetaNotFound {
                role: role.to_owned(),
            });
        }
        if let Some(key) = state.handed_out.get(role) {
            return Ok(key.clone());
        }
        let key = state.crypto.create(role, KeyAlgorithm::Ecdsa)?;
        state.handed_out.insert(role.to_owned(), key.clone());
        Ok(key)
    }
}
