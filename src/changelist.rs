// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the changelist: a durable, ordered log of staged mutations that
//! is replayed against the repository at publish time and drained
//! afterwards.

use crate::error::{self, Result};
use crate::schema::decoded::{Base64, Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::RoleType;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// What a staged change does to its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Create or overwrite.
    Create,
    /// Mutate an existing subject.
    Update,
    /// Remove; removing an absent subject is tolerated.
    Delete,
}

forward_display_to_serde!(ChangeAction);
forward_from_str_to_serde!(ChangeAction);

/// What kind of subject a staged change addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ChangeKind {
    /// A target under some targets role.
    #[serde(rename = "target")]
    Target,
    /// A delegation edge.
    #[serde(rename = "delegation")]
    Delegation,
    /// A base role's key set inside root metadata.
    #[serde(rename = "root-role")]
    RootRole,
}

forward_display_to_serde!(ChangeKind);
forward_from_str_to_serde!(ChangeKind);

/// One staged mutation. `content` is decoded according to `kind`:
/// [`crate::schema::FileMeta`] JSON for targets, [`TufDelegation`] JSON for
/// delegations, [`RootRoleChange`] JSON for root-role changes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Change {
    /// What this change does.
    pub action: ChangeAction,
    /// The role the change addresses: a targets role for target and
    /// delegation changes, `root` for root-role changes.
    pub scope: String,
    /// The kind of subject.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// The target path (target changes) or role name (root-role changes).
    pub path: String,
    /// The typed payload, stored as base64 bytes.
    pub content: Decoded<Base64>,
}

impl Change {
    /// A new change with the given payload bytes.
    pub fn new(
        action: ChangeAction,
        scope: &str,
        kind: ChangeKind,
        path: &str,
        content: Vec<u8>,
    ) -> Self {
        Self {
            action,
            scope: scope.to_owned(),
            kind,
            path: path.to_owned(),
            content: content.into(),
        }
    }
}

/// The payload of a delegation change: key, threshold and path-scope
/// mutations applied to the delegated role named by the change's scope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TufDelegation {
    /// The new signature threshold; zero leaves the threshold unchanged.
    pub new_threshold: u64,
    /// Public keys to authorize for the role.
    pub add_keys: Vec<Key>,
    /// IDs of keys to deauthorize, applied before `add_keys`.
    pub remove_keys: Vec<Decoded<Hex>>,
    /// Path prefixes to add to the role's scope.
    pub add_paths: Vec<String>,
    /// Path prefixes to remove.
    pub remove_paths: Vec<String>,
    /// Path hash prefixes to add.
    pub add_path_hash_prefixes: Vec<String>,
    /// Path hash prefixes to remove.
    pub remove_path_hash_prefixes: Vec<String>,
    /// Empty both path lists before applying adds and removes.
    pub clear_all_paths: bool,
}

/// The payload of a root-role change: the complete new key set for a base
/// role, staged by key rotation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RootRoleChange {
    /// The base role whose keys are replaced.
    pub role: RoleType,
    /// The new key set.
    pub keys: Vec<Key>,
}

/// The scope used by root-role changes.
pub const SCOPE_ROOT: &str = "root";

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The changelist capability: an append-only ordered log of [`Change`]s.
pub trait Changelist: fmt::Debug {
    /// Every staged change, in insertion order.
    fn list(&self) -> Result<Vec<Change>>;

    /// Appends a change.
    fn add(&self, change: Change) -> Result<()>;

    /// Drops every staged change.
    fn clear(&self) -> Result<()>;
}

/// An in-memory changelist.
#[derive(Debug, Default)]
pub struct MemChangelist {
    changes: RwLock<Vec<Change>>,
}

impl MemChangelist {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Changelist for MemChangelist {
    fn list(&self) -> Result<Vec<Change>> {
        Ok(self
            .changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn add(&self, change: Change) -> Result<()> {
        self.changes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.changes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// A changelist durably stored as one JSON file per change, named by a
/// zero-padded insertion index so that directory order is insertion order.
#[derive(Debug, Clone)]
pub struct FileChangelist {
    dir: PathBuf,
}

impl FileChangelist {
    /// Opens (creating if needed) the changelist directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context(error::DirCreateSnafu { path: &dir })?;
        Ok(Self { dir })
    }

    /// Change files in insertion order, keyed by their index.
    fn files(&self) -> Result<BTreeMap<u64, PathBuf>> {
        let mut files = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err).context(error::DirReadSnafu { path: &self.dir }),
        };
        for entry in entries {
            let path = entry.context(error::DirReadSnafu { path: &self.dir })?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                files.insert(index, path);
            }
        }
        Ok(files)
    }
}

impl Changelist for FileChangelist {
    fn list(&self) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for (_, path) in self.files()? {
            let data = std::fs::read(&path).context(error::FileReadSnafu { path: &path })?;
            let change = serde_json::from_slice(&data).context(error::ParseMetadataSnafu {
                role: format!("change {}", path.display()),
            })?;
            changes.push(change);
        }
        Ok(changes)
    }

    fn add(&self, change: Change) -> Result<()> {
        let next = self.files()?.keys().next_back().map_or(0, |last| last + 1);
        let path = self.dir.join(format!("{next:010}.json"));
        let data = serde_json::to_vec_pretty(&change).context(error::JsonSerializationSnafu {
            what: "staged change",
        })?;
        std::fs::write(&path, data).context(error::FileWriteSnafu { path })
    }

    fn clear(&self) -> Result<()> {
        for (_, path) in self.files()? {
            debug!("removing staged change '{}'", path.display());
            std::fs::remove_file(&path).context(error::FileRemoveSnafu { path })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FileMeta;

    fn target_change(path: &str) -> Change {
        let meta = FileMeta::from_bytes(b"content");
        Change::new(
            ChangeAction::Create,
            "targets",
            ChangeKind::Target,
            path,
            serde_json::to_vec(&meta).unwrap(),
        )
    }

    #[test]
    fn mem_list_preserves_insertion_order() {
        let list = MemChangelist::new();
        list.add(target_change("a")).unwrap();
        list.add(target_change("b")).unwrap();
        list.add(target_change("c")).unwrap();
        let paths: Vec<String> = list.list().unwrap().into_iter().map(|c| c.path).collect();
        assert_eq!(paths, ["a", "b", "c"]);
        list.clear().unwrap();
        assert!(list.list().unwrap().is_empty());
    }

    #[test]
    fn file_list_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let list = FileChangelist::new(dir.path().join("changelist")).unwrap();
            for name in ["first", "second", "third"] {
                list.add(target_change(name)).unwrap();
            }
        }
        let list = FileChangelist::new(dir.path().join("changelist")).unwrap();
        let paths: Vec<String> = list.list().unwrap().into_iter().map(|c| c.path).collect();
        assert_eq!(paths, ["first", "second", "third"]);

        list.clear().unwrap();
        assert!(list.list().unwrap().is_empty());
        let list = FileChangelist::new(dir.path().join("changelist")).unwrap();
        assert!(list.list().unwrap().is_empty());
    }

    #[test]
    fn indices_keep_growing_after_partial_clear() {
        let dir = tempfile::tempdir().unwrap();
        let list = FileChangelist::new(dir.path()).unwrap();
        list.add(target_change("a")).unwrap();
        list.add(target_change("b")).unwrap();
        // simulate an externally removed early entry
        std::fs::remove_file(dir.path().join("0000000000.json")).unwrap();
        list.add(target_change("c")).unwrap();
        let paths: Vec<String> = list.list().unwrap().into_iter().map(|c| c.path).collect();
        assert_eq!(paths, ["b", "c"]);
    }

    #[test]
    fn change_round_trips_through_json() {
        let change = Change::new(
            ChangeAction::Delete,
            "targets/level1",
            ChangeKind::Delegation,
            "",
            Vec::new(),
        );
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"type\":\"delegation\""));
        assert!(json.contains("\"action\":\"delete\""));
        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn delegation_payload_defaults() {
        let td: TufDelegation = serde_json::from_str(r#"{"new_threshold":1}"#).unwrap();
        assert_eq!(td.new_threshold, 1);
        assert!(td.add_keys.is_empty());
        assert!(!td.clear_all_paths);
    }
}
