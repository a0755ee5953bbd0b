// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the in-memory repository of signed metadata: one root, a tree
//! of targets roles, a snapshot and a timestamp, plus the dirty-tracking
//! and signing machinery that turns staged mutations into publishable
//! bytes.

use crate::crypto::CryptoService;
use crate::error::{self, Error, Result};
use crate::keydb::KeyDb;
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{
    canonical_json, is_delegation, parent_role, DelegatedRole, Delegations, FileMeta, Role,
    RoleType, Root, Signature, Signed, Snapshot, Targets, Timestamp, CANONICAL_ROOT_ROLE,
    CANONICAL_SNAPSHOT_ROLE, CANONICAL_TARGETS_ROLE, CANONICAL_TIMESTAMP_ROLE,
};
use crate::sign::Sign;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use ring::rand::SystemRandom;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{HashMap, HashSet};

/// Days before root expiry at which publish re-signs it even when clean.
const ROOT_EXPIRY_SLACK_DAYS: i64 = 182;

/// The default relative expiry for freshly signed metadata of each role.
pub fn default_expires(role: RoleType) -> DateTime<Utc> {
    let days = match role {
        RoleType::Root => 3650,
        RoleType::Targets | RoleType::Snapshot => 1095,
        RoleType::Timestamp => 14,
    };
    Utc::now() + Duration::days(days)
}

/// The in-memory signed metadata repository for one GUN.
///
/// The repository tracks which roles have been mutated since they were
/// loaded or last signed. Signing a clean role returns its current bytes
/// unchanged, so re-publishing an unmodified repository pushes identical
/// metadata.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    /// The root metadata, once initialized or loaded.
    pub root: Option<Signed<Root>>,
    /// Every loaded targets role, keyed by role name (`targets`,
    /// `targets/a`, ...).
    pub targets: HashMap<String, Signed<Targets>>,
    /// The snapshot metadata, if present. Absent between a server-managed
    /// initialize and the next publish.
    pub snapshot: Option<Signed<Snapshot>>,
    /// The timestamp metadata, if pulled.
    pub timestamp: Option<Signed<Timestamp>>,
    /// Role records and keys, rebuilt on every bootstrap.
    pub keydb: KeyDb,
    dirty: HashSet<String>,
}

impl Repo {
    /// An empty repository over the given key database.
    pub fn new(keydb: KeyDb) -> Self {
        Self {
            keydb,
            ..Self::default()
        }
    }

    /// True if `role` has unsigned mutations.
    pub fn is_dirty(&self, role: &str) -> bool {
        self.dirty.contains(role)
    }

    pub(crate) fn touch(&mut self, role: &str) {
        self.dirty.insert(role.to_owned());
    }

    pub(crate) fn clear_dirty(&mut self, role: &str) {
        self.dirty.remove(role);
    }

    /// True when the root's remaining lifetime is inside the slack window
    /// and publish should re-sign it even if clean.
    pub fn root_near_expiry(&self) -> bool {
        match &self.root {
            Some(root) => {
                root.signed.expires - Utc::now() < Duration::days(ROOT_EXPIRY_SLACK_DAYS)
            }
            None => false,
        }
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Builds fresh root metadata from the key database, which must hold a
    /// record for each of the four base roles.
    pub fn init_root(&mut self) -> Result<()> {
        let mut roles = HashMap::new();
        let mut keys = HashMap::new();
        for role in [
            RoleType::Root,
            RoleType::Targets,
            RoleType::Snapshot,
            RoleType::Timestamp,
        ] {
            let record = self
                .keydb
                .role(role.name())
                .context(error::BadHierarchySnafu {
                    reason: "a base role has no key record",
                })?
                .clone();
            for keyid in &record.keyids {
                let key = self
                    .keydb
                    .key(keyid)
                    .context(error::BadHierarchySnafu {
                        reason: "a base role references an unknown key",
                    })?
                    .clone();
                keys.insert(keyid.clone(), key);
            }
            roles.insert(role, record);
        }

        self.root = Some(Signed {
            signed: Root {
                version: 0,
                expires: default_expires(RoleType::Root),
                keys,
                roles,
                _extra: HashMap::new(),
            },
            signatures: Vec::new(),
        });
        self.touch(CANONICAL_ROOT_ROLE);
        Ok(())
    }

    /// Creates an empty targets role called `role`.
    pub fn init_targets(&mut self, role: &str) -> Result<()> {
        ensure!(
            crate::schema::is_valid_targets_role(role),
            error::InvalidRoleSnafu {
                role,
                reason: "not a valid targets role name",
            }
        );
        self.targets.insert(
            role.to_owned(),
            Signed {
                signed: Targets {
                    version: 0,
                    expires: default_expires(RoleType::Targets),
                    targets: HashMap::new(),
                    delegations: Delegations::default(),
                    _extra: HashMap::new(),
                },
                signatures: Vec::new(),
            },
        );
        self.touch(role);
        Ok(())
    }

    /// Creates snapshot metadata covering the current root and targets
    /// roles.
    pub fn init_snapshot(&mut self) -> Result<()> {
        let meta = self.snapshot_meta()?;
        self.snapshot = Some(Signed {
            signed: Snapshot {
                version: 0,
                expires: default_expires(RoleType::Snapshot),
                meta,
                _extra: HashMap::new(),
            },
            signatures: Vec::new(),
        });
        self.touch(CANONICAL_SNAPSHOT_ROLE);
        Ok(())
    }

    /// Creates timestamp metadata covering the current snapshot.
    pub fn init_timestamp(&mut self) -> Result<()> {
        let meta = self.timestamp_meta()?;
        self.timestamp = Some(Signed {
            signed: Timestamp {
                version: 0,
                expires: default_expires(RoleType::Timestamp),
                meta,
                _extra: HashMap::new(),
            },
            signatures: Vec::new(),
        });
        self.touch(CANONICAL_TIMESTAMP_ROLE);
        Ok(())
    }

    /// Installs decoded root metadata and rebuilds the key database from
    /// it.
    pub fn set_root(&mut self, signed: Signed<Root>) -> Result<()> {
        self.keydb = KeyDb::from_root(&signed.signed)?;
        // Delegation records from already-loaded targets stay valid.
        let loaded: Vec<Signed<Targets>> = self.targets.values().cloned().collect();
        for targets in &loaded {
            self.keydb.load_delegations(&targets.signed)?;
        }
        self.dirty.remove(CANONICAL_ROOT_ROLE);
        self.root = Some(signed);
        Ok(())
    }

    /// Installs decoded targets metadata for `role` and records its
    /// delegations in the key database.
    pub fn set_targets(&mut self, role: &str, signed: Signed<Targets>) -> Result<()> {
        ensure!(
            crate::schema::is_valid_targets_role(role),
            error::InvalidRoleSnafu {
                role,
                reason: "not a valid targets role name",
            }
        );
        self.keydb.load_delegations(&signed.signed)?;
        self.dirty.remove(role);
        self.targets.insert(role.to_owned(), signed);
        Ok(())
    }

    /// Installs decoded snapshot metadata.
    pub fn set_snapshot(&mut self, signed: Signed<Snapshot>) {
        self.dirty.remove(CANONICAL_SNAPSHOT_ROLE);
        self.snapshot = Some(signed);
    }

    /// Installs decoded timestamp metadata.
    pub fn set_timestamp(&mut self, signed: Signed<Timestamp>) {
        self.dirty.remove(CANONICAL_TIMESTAMP_ROLE);
        self.timestamp = Some(signed);
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Sets `targets[path]` on `role`. The path must fall inside the
    /// role's delegated scope and the metadata must carry a sha256 digest.
    pub fn add_target_to_role(&mut self, role: &str, path: &str, meta: FileMeta) -> Result<()> {
        ensure!(
            meta.sha256().map_or(false, |h| h.len() == 32),
            error::InvalidTargetMetaSnafu { path }
        );
        if role != CANONICAL_TARGETS_ROLE {
            let chain = self
                .delegation_chain(role)
                .context(error::InvalidRoleSnafu {
                    role,
                    reason: "role is not reachable from targets",
                })?;
            ensure!(
                chain.iter().all(|link| link.check_path(path)),
                error::InvalidRoleSnafu {
                    role,
                    reason: "target path is outside the role's delegated scope",
                }
            );
        }
        let signed = self
            .targets
            .get_mut(role)
            .context(error::NoSuchRoleSnafu { role })?;
        signed.signed.targets.insert(path.to_owned(), meta);
        self.touch(role);
        Ok(())
    }

    /// Removes `targets[path]` from `role`. A missing path is not an
    /// error.
    pub fn remove_target_from_role(&mut self, role: &str, path: &str) -> Result<()> {
        if let Some(signed) = self.targets.get_mut(role) {
            signed.signed.targets.remove(path);
            self.touch(role);
        }
        Ok(())
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// True when a delegation called `name` exists on its parent.
    pub fn delegation_exists(&self, name: &str) -> bool {
        parent_role(name)
            .and_then(|parent| self.targets.get(parent))
            .map_or(false, |parent| {
                parent.signed.delegations.role(name).is_some()
            })
    }

    /// Creates a delegation on `name`'s parent.
    pub fn create_delegation(
        &mut self,
        name: &str,
        keys: Vec<Key>,
        threshold: u64,
        paths: Option<Vec<String>>,
        path_hash_prefixes: Option<Vec<String>>,
    ) -> Result<()> {
        ensure!(
            is_delegation(name),
            error::InvalidRoleSnafu {
                role: name,
                reason: "invalid delegation role name",
            }
        );
        ensure!(
            threshold > 0,
            error::InvalidRoleSnafu {
                role: name,
                reason: "threshold must be positive",
            }
        );
        let parent = parent_role(name).context(error::InvalidRoleSnafu {
            role: name,
            reason: "delegation has no parent",
        })?;
        ensure!(
            self.targets.contains_key(parent),
            error::InvalidRoleSnafu {
                role: name,
                reason: "parent targets role does not exist",
            }
        );
        ensure!(
            !self.delegation_exists(name),
            error::InvalidRoleSnafu {
                role: name,
                reason: "delegation already exists",
            }
        );

        let mut keyids = Vec::new();
        let mut key_objects = Vec::new();
        for key in keys {
            let keyid = key.key_id().context(error::SchemaSnafu)?;
            if !keyids.contains(&keyid) {
                keyids.push(keyid.clone());
                key_objects.push((keyid, key));
            }
        }
        let role = DelegatedRole {
            name: name.to_owned(),
            keyids,
            threshold,
            paths: paths.filter(|p| !p.is_empty()),
            path_hash_prefixes: path_hash_prefixes.filter(|p| !p.is_empty()),
            _extra: HashMap::new(),
        };
        ensure!(!role.paths_conflict(), error::PathConflictSnafu { role: name });

        for (keyid, key) in &key_objects {
            self.keydb.add_key(key.clone())?;
            let parent_signed = self
                .targets
                .get_mut(parent)
                .context(error::NoSuchRoleSnafu { role: parent })?;
            parent_signed
                .signed
                .delegations
                .keys
                .insert(keyid.clone(), key.clone());
        }
        let record = role.role_keys();
        let parent_signed = self
            .targets
            .get_mut(parent)
            .context(error::NoSuchRoleSnafu { role: parent })?;
        parent_signed.signed.delegations.roles.push(role);
        self.keydb.add_role(name, record).map_err(|_| {
            Error::InvalidRole {
                role: name.to_owned(),
                reason: "delegation record could not be installed",
            }
        })?;
        self.touch(parent);
        Ok(())
    }

    /// Applies a key-set mutation to an existing delegation: `remove`
    /// first, then `add`; `threshold` is updated when nonzero. Keys no
    /// delegation of the parent references anymore are dropped.
    pub fn update_delegation_keys(
        &mut self,
        name: &str,
        add: Vec<Key>,
        remove: &[Decoded<Hex>],
        threshold: u64,
    ) -> Result<()> {
        let parent = parent_role(name).context(error::InvalidRoleSnafu {
            role: name,
            reason: "invalid delegation role name",
        })?;
        ensure!(
            self.delegation_exists(name),
            error::NoSuchRoleSnafu { role: name }
        );

        let mut added = Vec::new();
        for key in add {
            let keyid = key.key_id().context(error::SchemaSnafu)?;
            self.keydb.add_key(key.clone())?;
            added.push((keyid, key));
        }

        let parent_signed = self
            .targets
            .get_mut(parent)
            .context(error::NoSuchRoleSnafu { role: parent })?;
        let delegations = &mut parent_signed.signed.delegations;
        for (keyid, key) in &added {
            delegations.keys.insert(keyid.clone(), key.clone());
        }
        let role = delegations
            .role_mut(name)
            .context(error::NoSuchRoleSnafu { role: name })?;
        role.keyids.retain(|id| !remove.contains(id));
        for (keyid, _) in &added {
            if !role.keyids.contains(keyid) {
                role.keyids.push(keyid.clone());
            }
        }
        if threshold > 0 {
            role.threshold = threshold;
        }
        let record = role.role_keys();
        delegations.prune_unused_keys();
        self.keydb
            .add_role(name, record)
            .map_err(|_| Error::InvalidRole {
                role: name.to_owned(),
                reason: "delegation record could not be installed",
            })?;
        self.touch(parent);
        Ok(())
    }

    /// Applies a path-scope mutation to an existing delegation. With
    /// `clear_all` both lists are emptied before the adds and removes are
    /// applied. Fails without mutating anything if the result would carry
    /// both paths and path hash prefixes.
    pub fn update_delegation_paths(
        &mut self,
        name: &str,
        add_paths: &[String],
        remove_paths: &[String],
        add_prefixes: &[String],
        remove_prefixes: &[String],
        clear_all: bool,
    ) -> Result<()> {
        let parent = parent_role(name).context(error::InvalidRoleSnafu {
            role: name,
            reason: "invalid delegation role name",
        })?;
        ensure!(
            self.delegation_exists(name),
            error::NoSuchRoleSnafu { role: name }
        );
        let parent_signed = self
            .targets
            .get_mut(parent)
            .context(error::NoSuchRoleSnafu { role: parent })?;
        let role = parent_signed
            .signed
            .delegations
            .role_mut(name)
            .context(error::NoSuchRoleSnafu { role: name })?;

        // Work on a copy so a post-condition failure leaves the role
        // untouched.
        let mut updated = role.clone();
        if clear_all {
            updated.paths = None;
            updated.path_hash_prefixes = None;
        }
        let mut paths = updated.paths.take().unwrap_or_default();
        paths.retain(|p| !remove_paths.contains(p));
        for path in add_paths {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        updated.paths = if paths.is_empty() { None } else { Some(paths) };

        let mut prefixes = updated.path_hash_prefixes.take().unwrap_or_default();
        prefixes.retain(|p| !remove_prefixes.contains(p));
        for prefix in add_prefixes {
            if !prefixes.contains(prefix) {
                prefixes.push(prefix.clone());
            }
        }
        updated.path_hash_prefixes = if prefixes.is_empty() {
            None
        } else {
            Some(prefixes)
        };

        ensure!(
            !updated.paths_conflict(),
            error::PathConflictSnafu { role: name }
        );
        *role = updated;
        self.touch(parent);
        Ok(())
    }

    /// Deletes the delegation `name` from its parent, dropping orphaned
    /// keys and any loaded metadata of the deleted subtree. A missing role
    /// is not an error.
    pub fn delete_delegation(&mut self, name: &str) -> Result<()> {
        let Some(parent) = parent_role(name) else {
            return error::InvalidRoleSnafu {
                role: name,
                reason: "invalid delegation role name",
            }
            .fail();
        };
        let Some(parent_signed) = self.targets.get_mut(parent) else {
            return Ok(());
        };
        let delegations = &mut parent_signed.signed.delegations;
        let before = delegations.roles.len();
        delegations.roles.retain(|role| role.name != name);
        if delegations.roles.len() == before {
            return Ok(());
        }
        delegations.prune_unused_keys();
        self.keydb.remove_role(name);

        let subtree = format!("{name}/");
        let dropped: Vec<String> = self
            .targets
            .keys()
            .filter(|role| *role == name || role.starts_with(&subtree))
            .cloned()
            .collect();
        for role in dropped {
            debug!("dropping metadata for deleted delegation '{}'", role);
            self.targets.remove(&role);
            self.keydb.remove_role(&role);
            self.dirty.remove(&role);
        }
        self.touch(parent);
        Ok(())
    }

    /// Replaces the key set of a base role inside root metadata, marking
    /// root dirty. Used by key rotation.
    pub fn set_root_role_keys(&mut self, role: RoleType, keys: Vec<Key>) -> Result<()> {
        let mut pairs = Vec::new();
        for key in keys {
            let keyid = key.key_id().context(error::SchemaSnafu)?;
            self.keydb.add_key(key.clone())?;
            pairs.push((keyid, key));
        }
        let signed = self.root.as_mut().context(error::RepoNotInitializedSnafu)?;
        signed.signed.set_role_keys(role, pairs);
        let record = signed
            .signed
            .roles
            .get(&role)
            .context(error::BadHierarchySnafu {
                reason: "rotated role vanished from root",
            })?
            .clone();
        self.keydb
            .add_role(role.name(), record)
            .map_err(|_| Error::InvalidRole {
                role: role.name().to_owned(),
                reason: "rotated role record could not be installed",
            })?;
        self.touch(CANONICAL_ROOT_ROLE);
        Ok(())
    }

    /// Restores a targets role to a previously captured state, re-syncing
    /// the key database. Used to roll back a failed delegation update.
    pub(crate) fn restore_targets(&mut self, role: &str, saved: Signed<Targets>) -> Result<()> {
        self.keydb.load_delegations(&saved.signed)?;
        self.targets.insert(role.to_owned(), saved);
        Ok(())
    }

    /// The chain of delegated roles from `targets` down to `name`, if every
    /// link exists.
    pub fn delegation_chain(&self, name: &str) -> Option<Vec<&DelegatedRole>> {
        if !is_delegation(name) {
            return None;
        }
        let mut chain = Vec::new();
        let mut parent = CANONICAL_TARGETS_ROLE.to_owned();
        let segments: Vec<&str> = name.split('/').skip(1).collect();
        let mut child = CANONICAL_TARGETS_ROLE.to_owned();
        for segment in segments {
            child = format!("{child}/{segment}");
            let role = self.targets.get(&parent)?.signed.delegations.role(&child)?;
            chain.push(role);
            parent = child.clone();
        }
        Some(chain)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Walks targets roles in priority order, yielding
    /// `(path, meta, role)` with first-occurrence-wins shadowing. An empty
    /// `roles` list walks `targets` and its delegations in pre-order; an
    /// explicit list is walked leftmost-first with `targets` appended last
    /// if unnamed. A delegated role's target is only yielded when the path
    /// is inside the scope of every link of the delegation chain.
    pub fn walk_targets(&self, roles: &[String]) -> Vec<(String, FileMeta, String)> {
        let mut order: Vec<String> = if roles.is_empty() {
            vec![CANONICAL_TARGETS_ROLE.to_owned()]
        } else {
            let mut order = roles.to_vec();
            if !order.iter().any(|r| r == CANONICAL_TARGETS_ROLE) {
                order.push(CANONICAL_TARGETS_ROLE.to_owned());
            }
            order
        };

        let mut visited = HashSet::new();
        let mut seen_targets = HashSet::new();
        let mut found = Vec::new();
        for role in order.drain(..) {
            self.walk_role(&role, &mut visited, &mut seen_targets, &mut found);
        }
        found
    }

    fn walk_role(
        &self,
        role: &str,
        visited: &mut HashSet<String>,
        seen_targets: &mut HashSet<String>,
        found: &mut Vec<(String, FileMeta, String)>,
    ) {
        if !visited.insert(role.to_owned()) {
            return;
        }
        let chain = if role == CANONICAL_TARGETS_ROLE {
            Vec::new()
        } else {
            match self.delegation_chain(role) {
                Some(chain) => chain,
                None => return,
            }
        };
        let Some(signed) = self.targets.get(role) else {
            return;
        };
        for (path, meta) in &signed.signed.targets {
            if !chain.iter().all(|link| link.check_path(path)) {
                continue;
            }
            if seen_targets.insert(path.clone()) {
                found.push((path.clone(), meta.clone(), role.to_owned()));
            }
        }
        let children: Vec<String> = signed
            .signed
            .delegations
            .roles
            .iter()
            .map(|child| child.name.clone())
            .collect();
        for child in children {
            self.walk_role(&child, visited, seen_targets, found);
        }
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Signs root metadata if it is dirty or unsigned (bumping its version
    /// and installing `expires`), then returns its canonical bytes.
    pub fn sign_root(&mut self, expires: DateTime<Utc>, crypto: &CryptoService) -> Result<Vec<u8>> {
        let signed = self.root.as_mut().context(error::RepoNotInitializedSnafu)?;
        if self.dirty.contains(CANONICAL_ROOT_ROLE) || signed.signatures.is_empty() {
            signed.signed.version += 1;
            signed.signed.expires = expires;
            sign_object(signed, CANONICAL_ROOT_ROLE, &self.keydb, crypto)?;
            self.dirty.remove(CANONICAL_ROOT_ROLE);
        }
        canonical_json(signed, "signed root").context(error::SchemaSnafu)
    }

    /// Signs the targets role `role` if dirty or unsigned, then returns its
    /// canonical bytes.
    pub fn sign_targets(
        &mut self,
        role: &str,
        expires: DateTime<Utc>,
        crypto: &CryptoService,
    ) -> Result<Vec<u8>> {
        let signed = self
            .targets
            .get_mut(role)
            .context(error::NoSuchRoleSnafu { role })?;
        if self.dirty.contains(role) || signed.signatures.is_empty() {
            signed.signed.version += 1;
            signed.signed.expires = expires;
            sign_object(signed, role, &self.keydb, crypto)?;
            self.dirty.remove(role);
        }
        canonical_json(signed, "signed targets").context(error::SchemaSnafu)
    }

    /// Recomputes the snapshot's pinned metadata, signs the snapshot if
    /// anything changed, and returns its canonical bytes. Fails with
    /// [`Error::NoKeys`] when the snapshot key is held by the server.
    pub fn sign_snapshot(
        &mut self,
        expires: DateTime<Utc>,
        crypto: &CryptoService,
    ) -> Result<Vec<u8>> {
        let meta = self.snapshot_meta()?;
        let signed = self
            .snapshot
            .as_mut()
            .context(error::RepoNotInitializedSnafu)?;
        if signed.signed.meta != meta {
            signed.signed.meta = meta;
            self.dirty.insert(CANONICAL_SNAPSHOT_ROLE.to_owned());
        }
        if self.dirty.contains(CANONICAL_SNAPSHOT_ROLE) || signed.signatures.is_empty() {
            signed.signed.version += 1;
            signed.signed.expires = expires;
            sign_object(signed, CANONICAL_SNAPSHOT_ROLE, &self.keydb, crypto)?;
            self.dirty.remove(CANONICAL_SNAPSHOT_ROLE);
        }
        canonical_json(signed, "signed snapshot").context(error::SchemaSnafu)
    }

    /// Recomputes the timestamp's pinned snapshot, signs the timestamp if
    /// anything changed, and returns its canonical bytes. Only useful where
    /// the caller holds the timestamp key, which production servers do not
    /// hand out.
    pub fn sign_timestamp(
        &mut self,
        expires: DateTime<Utc>,
        crypto: &CryptoService,
    ) -> Result<Vec<u8>> {
        let meta = self.timestamp_meta()?;
        let signed = self
            .timestamp
            .as_mut()
            .context(error::RepoNotInitializedSnafu)?;
        if signed.signed.meta != meta {
            signed.signed.meta = meta;
            self.dirty.insert(CANONICAL_TIMESTAMP_ROLE.to_owned());
        }
        if self.dirty.contains(CANONICAL_TIMESTAMP_ROLE) || signed.signatures.is_empty() {
            signed.signed.version += 1;
            signed.signed.expires = expires;
            sign_object(signed, CANONICAL_TIMESTAMP_ROLE, &self.keydb, crypto)?;
            self.dirty.remove(CANONICAL_TIMESTAMP_ROLE);
        }
        canonical_json(signed, "signed timestamp").context(error::SchemaSnafu)
    }

    /// The canonical bytes of a loaded targets role without re-signing.
    pub fn serialize_targets(&self, role: &str) -> Result<Vec<u8>> {
        let signed = self
            .targets
            .get(role)
            .context(error::NoSuchRoleSnafu { role })?;
        canonical_json(signed, "signed targets").context(error::SchemaSnafu)
    }

    fn snapshot_meta(&self) -> Result<HashMap<String, FileMeta>> {
        let mut meta = HashMap::new();
        if let Some(root) = &self.root {
            let bytes = canonical_json(root, "signed root").context(error::SchemaSnafu)?;
            meta.insert(CANONICAL_ROOT_ROLE.to_owned(), FileMeta::from_bytes(&bytes));
        }
        for (role, signed) in &self.targets {
            let bytes = canonical_json(signed, "signed targets").context(error::SchemaSnafu)?;
            meta.insert(role.clone(), FileMeta::from_bytes(&bytes));
        }
        Ok(meta)
    }

    fn timestamp_meta(&self) -> Result<HashMap<String, FileMeta>> {
        let mut meta = HashMap::new();
        if let Some(snapshot) = &self.snapshot {
            let bytes = canonical_json(snapshot, "signed snapshot").context(error::SchemaSnafu)?;
            meta.insert(
                CANONICAL_SNAPSHOT_ROLE.to_owned(),
                FileMeta::from_bytes(&bytes),
            );
        }
        Ok(meta)
    }
}

/// Signs the canonical form of a role with every authorized key the crypto
/// service holds, replacing the object's signature set.
fn sign_object<T>(
    signed: &mut Signed<T>,
    role: &str,
    keydb: &KeyDb,
    crypto: &CryptoService,
) -> Result<()>
where
    T: Role + Serialize,
{
    let record = keydb.role(role).context(error::NoSuchRoleSnafu { role })?;
    let message = signed.signed.canonical_form().context(error::SchemaSnafu)?;
    let rng = SystemRandom::new();

    let mut signatures = Vec::new();
    for keyid in &record.keyids {
        match crypto.get_private_key(&hex::encode(keyid)) {
            Ok((pair, _)) => {
                let key = pair.tuf_key();
                let sig = pair.sign(&message, &rng)?;
                signatures.push(Signature {
                    keyid: keyid.clone(),
                    method: key.method().to_owned(),
                    sig: sig.into(),
                });
            }
            Err(Error::KeyNotFound { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    ensure!(!signatures.is_empty(), error::NoKeysSnafu { role });
    ensure!(
        signatures.len() as u64 >= record.threshold,
        error::InsufficientSignaturesSnafu {
            role,
            found: signatures.len(),
            needed: record.threshold,
        }
    );
    signed.signatures = signatures;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_utils::empty_repo;
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use crate::keystore::MemoryKeyStore;

    #[test]
    fn sign_bumps_version_once() {
        let (mut repo, service) = empty_repo();
        let first = repo
            .sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        assert_eq!(repo.targets[CANONICAL_TARGETS_ROLE].signed.version, 1);

        // a clean role re-serializes without a new version or signature
        let second = repo
            .sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        assert_eq!(repo.targets[CANONICAL_TARGETS_ROLE].signed.version, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn mutation_marks_dirty_and_resigns() {
        let (mut repo, service) = empty_repo();
        let first = repo
            .sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        repo.add_target_to_role(
            CANONICAL_TARGETS_ROLE,
            "latest",
            FileMeta::from_bytes(b"content"),
        )
        .unwrap();
        assert!(repo.is_dirty(CANONICAL_TARGETS_ROLE));
        let second = repo
            .sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(repo.targets[CANONICAL_TARGETS_ROLE].signed.version, 2);
    }

    #[test]
    fn snapshot_meta_tracks_targets() {
        let (mut repo, service) = empty_repo();
        repo.sign_root(default_expires(RoleType::Root), &service)
            .unwrap();
        repo.sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        let snap1 = repo
            .sign_snapshot(default_expires(RoleType::Snapshot), &service)
            .unwrap();

        // an unchanged repo produces identical snapshot bytes
        let snap2 = repo
            .sign_snapshot(default_expires(RoleType::Snapshot), &service)
            .unwrap();
        assert_eq!(snap1, snap2);

        repo.add_target_to_role(
            CANONICAL_TARGETS_ROLE,
            "latest",
            FileMeta::from_bytes(b"content"),
        )
        .unwrap();
        repo.sign_targets(CANONICAL_TARGETS_ROLE, default_expires(RoleType::Targets), &service)
            .unwrap();
        let snap3 = repo
            .sign_snapshot(default_expires(RoleType::Snapshot), &service)
            .unwrap();
        assert_ne!(snap1, snap3);
    }

    #[test]
    fn signing_without_keys_is_no_keys() {
        let (mut repo, _service) = empty_repo();
        // a crypto service with an empty store holds no snapshot key
        let other = CryptoService::new("example.com/app", vec![Box::new(MemoryKeyStore::new())]);
        repo.touch(CANONICAL_SNAPSHOT_ROLE);
        assert!(matches!(
            repo.sign_snapshot(default_expires(RoleType::Snapshot), &other),
            Err(Error::NoKeys { .. })
        ));
    }

    #[test]
    fn near_expiry_window() {
        let (mut repo, _service) = empty_repo();
        assert!(!repo.root_near_expiry());
        if let Some(root) = repo.root.as_mut() {
            root.signed.expires = Utc::now() + Duration::days(30);
        }
        assert!(repo.root_near_expiry());
    }

    #[test]
    fn walk_respects_scope_and_shadowing() {
        let (mut repo, service) = empty_repo();
        let key = service.create("targets/level1", KeyAlgorithm::Ecdsa).unwrap();
        repo.create_delegation(
            "targets/level1",
            vec![key],
            1,
            Some(vec!["level1".to_string()]),
            None,
        )
        .unwrap();
        repo.init_targets("targets/level1").unwrap();

        repo.add_target_to_role(
            CANONICAL_TARGETS_ROLE,
            "level1/shared",
            FileMeta::from_bytes(b"parent"),
        )
        .unwrap();
        repo.add_target_to_role(
            "targets/level1",
            "level1/shared",
            FileMeta::from_bytes(b"child"),
        )
        .unwrap();
        repo.add_target_to_role(
            "targets/level1",
            "level1/only-child",
            FileMeta::from_bytes(b"child"),
        )
        .unwrap();

        // default order: the parent's copy shadows the child's
        let found = repo.walk_targets(&[]);
        let shared = found
            .iter()
            .find(|(path, ..)| path == "level1/shared")
            .unwrap();
        assert_eq!(shared.2, CANONICAL_TARGETS_ROLE);
        assert!(found.iter().any(|(path, ..)| path == "level1/only-child"));

        // explicit priority: the named role wins
        let found = repo.walk_targets(&["targets/level1".to_string()]);
        let shared = found
            .iter()
            .find(|(path, ..)| path == "level1/shared")
            .unwrap();
        assert_eq!(shared.2, "targets/level1");
    }

    #[test]
    fn out_of_scope_targets_are_hidden() {
        let (mut repo, service) = empty_repo();
        let key = service.create("targets/level1", KeyAlgorithm::Ecdsa).unwrap();
        repo.create_delegation(
            "targets/level1",
            vec![key],
            1,
            Some(vec!["level1".to_string()]),
            None,
        )
        .unwrap();
        repo.init_targets("targets/level1").unwrap();

        // out-of-scope adds are rejected at staging time
        assert!(repo
            .add_target_to_role(
                "targets/level1",
                "level2/out-of-scope",
                FileMeta::from_bytes(b"x"),
            )
            .is_err());

        // and a role whose scope was later narrowed hides stale targets
        repo.add_target_to_role("targets/level1", "level1/ok", FileMeta::from_bytes(b"x"))
            .unwrap();
        repo.update_delegation_paths(
            "targets/level1",
            &["other".to_string()],
            &["level1".to_string()],
            &[],
            &[],
            false,
        )
        .unwrap();
        let found = repo.walk_targets(&[]);
        assert!(!found.iter().any(|(path, ..)| path == "level1/ok"));
    }
}
