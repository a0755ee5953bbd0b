// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the metadata-store capability: a key-value byte store keyed by
//! role name, with "not found" reported distinctly from transport and IO
//! failures.

use crate::error::{self, Result};
use crate::schema::key::Key;
use log::debug;
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// A byte store of metadata blobs keyed by role name.
///
/// `get_meta` returns [`crate::Error::MetaNotFound`] when the store answered
/// and does not hold the role, as opposed to failing to answer.
pub trait MetadataStore: fmt::Debug {
    /// The current bytes for `role`, no larger than `max_size`.
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>>;

    /// Stores bytes for `role`.
    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()>;

    /// Stores several roles; remote implementations install all of them
    /// atomically in one round trip.
    fn set_multi_meta(&self, metas: &HashMap<String, Vec<u8>>) -> Result<()> {
        for (role, data) in metas {
            self.set_meta(role, data)?;
        }
        Ok(())
    }
}

/// The remote server capability: a metadata store that additionally hands
/// out server-managed public keys and serves checksum-addressed metadata.
pub trait RemoteStore: MetadataStore {
    /// The server-held public key for `role`.
    fn get_key(&self, role: &str) -> Result<Key>;

    /// The bytes for `role` addressed by their sha256 hex digest, enabling
    /// caches in front of the server. Implementations without
    /// checksum-addressed paths fall back to `get_meta`.
    fn get_meta_by_checksum(&self, role: &str, _sha256_hex: &str, max_size: u64) -> Result<Vec<u8>> {
        self.get_meta(role, max_size)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A filesystem metadata store at `<base_dir>/tuf/<gun>/metadata`, one
/// `<role>.json` per role with delegated roles nested under `targets/`.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    metadata_dir: PathBuf,
}

impl FilesystemStore {
    /// Opens (creating if needed) the metadata directory for `gun`.
    pub fn new<P: AsRef<Path>>(base_dir: P, gun: &str) -> Result<Self> {
        let metadata_dir = base_dir.as_ref().join("tuf").join(gun).join("metadata");
        std::fs::create_dir_all(&metadata_dir)
            .context(error::DirCreateSnafu { path: &metadata_dir })?;
        Ok(Self { metadata_dir })
    }

    fn path_for(&self, role: &str) -> PathBuf {
        self.metadata_dir.join(format!("{role}.json"))
    }

    /// Deletes every stored metadata file.
    pub fn remove_all(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.metadata_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(error::FileRemoveSnafu {
                path: &self.metadata_dir,
            }),
        }
    }
}

impl MetadataStore for FilesystemStore {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        let path = self.path_for(role);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return error::MetaNotFoundSnafu { role }.fail()
            }
            Err(err) => return Err(err).context(error::FileReadSnafu { path }),
        };
        ensure!(
            data.len() as u64 <= max_size,
            error::MaxSizeExceededSnafu {
                max_size,
                specifier: "cached metadata",
            }
        );
        Ok(data)
    }

    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(role);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(error::DirCreateSnafu { path: parent })?;
        }
        debug!("caching metadata for '{}'", role);
        std::fs::write(&path, data).context(error::FileWriteSnafu { path })
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// An in-memory metadata store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    metas: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        let guard = self.metas.read().unwrap_or_else(PoisonError::into_inner);
        let data = guard
            .get(role)
            .ok_or_else(|| crate::error::Error::MetaNotFound {
                role: role.to_owned(),
            })?;
        ensure!(
            data.len() as u64 <= max_size,
            error::MaxSizeExceededSnafu {
                max_size,
                specifier: "stored metadata",
            }
        );
        Ok(data.clone())
    }

    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()> {
        self.metas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role.to_owned(), data.to_vec());
        Ok(())
    }
}
