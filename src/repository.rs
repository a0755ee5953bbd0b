// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides [`TrustRepository`], the orchestrator that owns the signed
//! metadata, the changelist, the key machinery and the trust anchors for
//! one GUN, and drives the initialize / stage / publish / pull flows
//! against a remote server.

use crate::apply;
use crate::certs::{self, CertManager};
use crate::changelist::{
    Change, ChangeAction, ChangeKind, Changelist, FileChangelist, RootRoleChange, TufDelegation,
    SCOPE_ROOT,
};
use crate::client::TufClient;
use crate::crypto::{CryptoService, KeyAlgorithm, PassphraseRetriever};
use crate::error::{self, Error, Result};
use crate::keydb::KeyDb;
use crate::keystore::{FilesystemKeyStore, KeyStore};
use crate::repo::{default_expires, Repo};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::{Key, KeyVal};
use crate::schema::{
    is_delegation, is_valid_targets_role, FileMeta, RoleKeys, RoleType, Root, Signed,
    CANONICAL_ROOT_ROLE, CANONICAL_SNAPSHOT_ROLE, CANONICAL_TARGETS_ROLE,
    CANONICAL_TIMESTAMP_ROLE,
};
use crate::store::{FilesystemStore, MetadataStore, RemoteStore};
use crate::verify;
use crate::MAX_DOWNLOAD_SIZE;
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A named target: a content digest and length under a chosen name.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// The target name, e.g. `latest`.
    pub name: String,
    /// The content length in bytes.
    pub length: u64,
    /// Digests of the content, keyed by algorithm.
    pub hashes: HashMap<String, Decoded<Hex>>,
}

impl Target {
    /// A target named `name` describing the content of a file on disk.
    pub fn from_file<P: AsRef<Path>>(name: &str, path: P) -> Result<Self> {
        let meta = FileMeta::from_path(path).context(error::SchemaSnafu)?;
        Ok(Self {
            name: name.to_owned(),
            length: meta.length,
            hashes: meta.hashes,
        })
    }

    /// A target named `name` describing a byte string.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Self {
        let meta = FileMeta::from_bytes(bytes);
        Self {
            name: name.to_owned(),
            length: meta.length,
            hashes: meta.hashes,
        }
    }

    fn file_meta(&self) -> FileMeta {
        FileMeta {
            length: self.length,
            hashes: self.hashes.clone(),
            custom: HashMap::new(),
            _extra: HashMap::new(),
        }
    }
}

/// A target together with the role it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetWithRole {
    /// The target.
    pub target: Target,
    /// The role that signed it.
    pub role: String,
}

/// The trust engine for one GUN.
///
/// All methods are meant to be called from one logical task; concurrent
/// instances over the same base directory are unsupported.
#[derive(Debug)]
pub struct TrustRepository {
    gun: String,
    base_dir: PathBuf,
    remote: Box<dyn RemoteStore>,
    local: FilesystemStore,
    changelist_dir: PathBuf,
    /// The key machinery for this GUN.
    pub crypto: CryptoService,
    /// The X.509 trust anchor store.
    pub cert_manager: CertManager,
    repo: Option<Repo>,
}

impl TrustRepository {
    /// A repository rooted at `base_dir` for `gun`, with keys unlocked
    /// through `retriever`.
    pub fn new<P: AsRef<Path>>(
        base_dir: P,
        gun: &str,
        remote: Box<dyn RemoteStore>,
        retriever: PassphraseRetriever,
    ) -> Result<Self> {
        let key_store: Box<dyn KeyStore> =
            Box::new(FilesystemKeyStore::new(&base_dir, gun, retriever)?);
        Self::with_key_stores(base_dir, gun, remote, vec![key_store])
    }

    /// A repository over caller-provided key stores, in order of
    /// preference.
    pub fn with_key_stores<P: AsRef<Path>>(
        base_dir: P,
        gun: &str,
        remote: Box<dyn RemoteStore>,
        key_stores: Vec<Box<dyn KeyStore>>,
    ) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let crypto = CryptoService::new(gun, key_stores);
        let cert_manager = CertManager::new(&base_dir)?;
        let local = FilesystemStore::new(&base_dir, gun)?;
        let changelist_dir = base_dir.join("tuf").join(gun).join("changelist");
        Ok(Self {
            gun: gun.to_owned(),
            base_dir,
            remote,
            local,
            changelist_dir,
            crypto,
            cert_manager,
            repo: None,
        })
    }

    /// The GUN this repository serves.
    pub fn gun(&self) -> &str {
        &self.gun
    }

    /// The staged, unpublished changes.
    pub fn changelist(&self) -> Result<FileChangelist> {
        FileChangelist::new(&self.changelist_dir)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Creates a fresh repository signed by the private key `root_key_id`.
    ///
    /// Only `snapshot` and `timestamp` may be server-managed; `timestamp`
    /// always is, implicitly. Local keys are generated before the server is
    /// asked for its keys so that a local failure makes no network call.
    pub fn initialize(&mut self, root_key_id: &str, server_managed_roles: &[&str]) -> Result<()> {
        // Unlock the root key first; this may prompt the user.
        let (_pair, _role) = self.crypto.get_private_key(root_key_id)?;

        let mut server_manages_snapshot = false;
        for role in server_managed_roles {
            match *role {
                CANONICAL_TIMESTAMP_ROLE => continue,
                CANONICAL_SNAPSHOT_ROLE => server_manages_snapshot = true,
                other => return error::InvalidRemoteRoleSnafu { role: other }.fail(),
            }
        }
        let mut locally_managed = vec![CANONICAL_TARGETS_ROLE];
        let mut remotely_managed = vec![CANONICAL_TIMESTAMP_ROLE];
        if server_manages_snapshot {
            remotely_managed.push(CANONICAL_SNAPSHOT_ROLE);
        } else {
            locally_managed.push(CANONICAL_SNAPSHOT_ROLE);
        }

        // The root key is embedded in metadata as an X.509 certificate for
        // the GUN, linking root.json to the certificate trust anchor.
        let (algorithm, pkcs8, _) = self.crypto.get_key_material(root_key_id)?;
        let cert_pem = certs::generate_certificate(&pkcs8, &self.gun)?;
        self.cert_manager.add_trusted_cert(&cert_pem)?;
        let root_key = match algorithm {
            KeyAlgorithm::Ecdsa => Key::EcdsaX509 {
                keyval: KeyVal::new(cert_pem),
            },
            KeyAlgorithm::Rsa => Key::RsaX509 {
                keyval: KeyVal::new(cert_pem),
            },
            KeyAlgorithm::Ed25519 => {
                return error::InvalidRoleSnafu {
                    role: CANONICAL_ROOT_ROLE,
                    reason: "the root key must be an ECDSA or RSA key",
                }
                .fail()
            }
        };

        let mut keydb = KeyDb::new();
        let root_keyid = keydb.add_key(root_key)?;
        keydb.add_role(CANONICAL_ROOT_ROLE, RoleKeys::new(vec![root_keyid], 1))?;

        // Local keys before any network call.
        for role in locally_managed {
            let key = self.crypto.create(role, KeyAlgorithm::Ecdsa)?;
            let keyid = keydb.add_key(key)?;
            keydb.add_role(role, RoleKeys::new(vec![keyid], 1))?;
        }
        for role in remotely_managed {
            let key = self.remote.get_key(role)?;
            debug!("got remote {} key {}", role, key.key_id().map(|id| id.to_string()).unwrap_or_default());
            let keyid = keydb.add_key(key)?;
            keydb.add_role(role, RoleKeys::new(vec![keyid], 1))?;
        }

        let mut repo = Repo::new(keydb);
        repo.init_root()?;
        repo.init_targets(CANONICAL_TARGETS_ROLE)?;
        repo.init_snapshot()?;
        self.repo = Some(repo);

        self.save_metadata(server_manages_snapshot)
    }

    /// Signs and writes the current metadata to the local cache.
    fn save_metadata(&mut self, ignore_snapshot: bool) -> Result<()> {
        debug!("saving metadata for '{}' to the local cache", self.gun);
        let repo = self
            .repo
            .as_mut()
            .context(error::RepoNotInitializedSnafu)?;

        let root = repo.sign_root(default_expires(RoleType::Root), &self.crypto)?;
        self.local.set_meta(CANONICAL_ROOT_ROLE, &root)?;

        let roles: Vec<String> = repo.targets.keys().cloned().collect();
        for role in roles {
            let bytes = repo.sign_targets(&role, default_expires(RoleType::Targets), &self.crypto)?;
            self.local.set_meta(&role, &bytes)?;
        }

        if ignore_snapshot {
            return Ok(());
        }
        let snapshot = repo.sign_snapshot(default_expires(RoleType::Snapshot), &self.crypto)?;
        self.local.set_meta(CANONICAL_SNAPSHOT_ROLE, &snapshot)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Appends one change per role to the changelist, defaulting to the
    /// top-level targets role. Every named role must be able to hold
    /// targets.
    fn add_target_changes(
        &self,
        action: ChangeAction,
        path: &str,
        content: Vec<u8>,
        roles: &[&str],
    ) -> Result<()> {
        let roles: Vec<&str> = if roles.is_empty() {
            vec![CANONICAL_TARGETS_ROLE]
        } else {
            roles.to_vec()
        };
        for role in &roles {
            ensure!(
                is_valid_targets_role(role),
                error::InvalidRoleSnafu {
                    role: *role,
                    reason: "cannot add targets to this role",
                }
            );
        }
        let changelist = self.changelist()?;
        for role in roles {
            changelist.add(Change::new(
                action,
                role,
                ChangeKind::Target,
                path,
                content.clone(),
            ))?;
        }
        Ok(())
    }

    /// Stages adding `target` to the given roles.
    pub fn add_target(&self, target: &Target, roles: &[&str]) -> Result<()> {
        debug!(
            "staging target '{}' ({} bytes) for '{}'",
            target.name, target.length, self.gun
        );
        let content = serde_json::to_vec(&target.file_meta()).context(
            error::JsonSerializationSnafu {
                what: "target metadata",
            },
        )?;
        self.add_target_changes(ChangeAction::Create, &target.name, content, roles)
    }

    /// Stages removing the target called `name` from the given roles.
    pub fn remove_target(&self, name: &str, roles: &[&str]) -> Result<()> {
        debug!("staging removal of target '{}' for '{}'", name, self.gun);
        self.add_target_changes(ChangeAction::Delete, name, Vec::new(), roles)
    }

    fn add_delegation_change(
        &self,
        action: ChangeAction,
        name: &str,
        delegation: Option<&TufDelegation>,
    ) -> Result<()> {
        ensure!(
            is_delegation(name),
            error::InvalidRoleSnafu {
                role: name,
                reason: "invalid delegation role name",
            }
        );
        let content = match delegation {
            Some(td) => serde_json::to_vec(td).context(error::JsonSerializationSnafu {
                what: "delegation change",
            })?,
            None => Vec::new(),
        };
        self.changelist()?.add(Change::new(
            action,
            name,
            ChangeKind::Delegation,
            "",
            content,
        ))
    }

    /// Stages a new delegation carrying both keys and paths.
    pub fn add_delegation(
        &self,
        name: &str,
        threshold: u64,
        keys: Vec<Key>,
        paths: Vec<String>,
    ) -> Result<()> {
        debug!(
            "staging delegation '{}' with threshold {}, {} key(s), {} path(s)",
            name,
            threshold,
            keys.len(),
            paths.len()
        );
        self.add_delegation_change(
            ChangeAction::Create,
            name,
            Some(&TufDelegation {
                new_threshold: threshold,
                add_keys: keys,
                add_paths: paths,
                ..TufDelegation::default()
            }),
        )
    }

    /// Stages removing the delegation entirely.
    pub fn remove_delegation(&self, name: &str) -> Result<()> {
        debug!("staging removal of delegation '{}'", name);
        self.add_delegation_change(ChangeAction::Delete, name, None)
    }

    /// Stages removing keys from a delegation.
    pub fn remove_delegation_keys(&self, name: &str, keyids: Vec<Decoded<Hex>>) -> Result<()> {
        self.add_delegation_change(
            ChangeAction::Update,
            name,
            Some(&TufDelegation {
                remove_keys: keyids,
                ..TufDelegation::default()
            }),
        )
    }

    /// Stages removing keys and paths from a delegation.
    pub fn remove_delegation_keys_and_paths(
        &self,
        name: &str,
        keyids: Vec<Decoded<Hex>>,
        paths: Vec<String>,
    ) -> Result<()> {
        self.add_delegation_change(
            ChangeAction::Update,
            name,
            Some(&TufDelegation {
                remove_keys: keyids,
                remove_paths: paths,
                ..TufDelegation::default()
            }),
        )
    }

    /// Stages clearing every path from a delegation's scope.
    pub fn clear_delegation_paths(&self, name: &str) -> Result<()> {
        self.add_delegation_change(
            ChangeAction::Update,
            name,
            Some(&TufDelegation {
                clear_all_paths: true,
                ..TufDelegation::default()
            }),
        )
    }

    /// Stages replacing the key set of `role`, generating the new key
    /// locally or asking the server for one.
    pub fn rotate_key(&self, role: &str, server_manages_key: bool) -> Result<()> {
        ensure!(
            role != CANONICAL_ROOT_ROLE && role != CANONICAL_TIMESTAMP_ROLE,
            error::InvalidRoleSnafu {
                role,
                reason: "rotation is not supported for this role",
            }
        );
        ensure!(
            !(server_manages_key && role == CANONICAL_TARGETS_ROLE),
            error::InvalidRemoteRoleSnafu { role }
        );
        let role_type = RoleType::from_name(role).context(error::InvalidRoleSnafu {
            role,
            reason: "not a base role",
        })?;

        let key = if server_manages_key {
            self.remote.get_key(role)?
        } else {
            self.crypto.create(role, KeyAlgorithm::Ecdsa)?
        };
        let payload = RootRoleChange {
            role: role_type,
            keys: vec![key],
        };
        let content = serde_json::to_vec(&payload).context(error::JsonSerializationSnafu {
            what: "root role change",
        })?;
        self.changelist()?.add(Change::new(
            ChangeAction::Create,
            SCOPE_ROOT,
            ChangeKind::RootRole,
            role,
            content,
        ))
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Seeds the repository from the remote root, validating it against
    /// the certificate trust anchor. A transport failure falls back to the
    /// locally cached root for offline reads; a remote 404 does not.
    fn bootstrap_client(&mut self) -> Result<()> {
        let root_bytes = match self.remote.get_meta(CANONICAL_ROOT_ROLE, MAX_DOWNLOAD_SIZE) {
            Ok(bytes) => bytes,
            Err(err) if err.is_meta_not_found() => return Err(err),
            Err(err) => {
                debug!("using cached root, remote failed: {}", err);
                match self.local.get_meta(CANONICAL_ROOT_ROLE, MAX_DOWNLOAD_SIZE) {
                    Ok(bytes) => bytes,
                    Err(_) => return Err(err),
                }
            }
        };
        let signed_root: Signed<Root> =
            serde_json::from_slice(&root_bytes).map_err(|source| Error::ParseMetadata {
                role: CANONICAL_ROOT_ROLE.to_owned(),
                source,
            })?;
        self.cert_manager.validate_root(&signed_root, &self.gun)?;

        let keydb = KeyDb::from_root(&signed_root.signed)?;
        verify::verify_meta(&signed_root, CANONICAL_ROOT_ROLE, &keydb)?;

        let mut repo = Repo::new(KeyDb::new());
        repo.set_root(signed_root)?;
        self.repo = Some(repo);
        Ok(())
    }

    /// Loads the repository from the local cache. The snapshot may be
    /// absent (server-managed case); anything else missing is an error.
    fn bootstrap_repo(&mut self) -> Result<()> {
        debug!("loading trusted collection for '{}' from disk", self.gun);
        let root_bytes = self.local.get_meta(CANONICAL_ROOT_ROLE, MAX_DOWNLOAD_SIZE)?;
        let signed_root: Signed<Root> =
            serde_json::from_slice(&root_bytes).map_err(|source| Error::ParseMetadata {
                role: CANONICAL_ROOT_ROLE.to_owned(),
                source,
            })?;
        let mut repo = Repo::new(KeyDb::new());
        repo.set_root(signed_root)?;

        let targets_bytes = self.local.get_meta(CANONICAL_TARGETS_ROLE, MAX_DOWNLOAD_SIZE)?;
        let signed_targets =
            serde_json::from_slice(&targets_bytes).map_err(|source| Error::ParseMetadata {
                role: CANONICAL_TARGETS_ROLE.to_owned(),
                source,
            })?;
        repo.set_targets(CANONICAL_TARGETS_ROLE, signed_targets)?;

        match self.local.get_meta(CANONICAL_SNAPSHOT_ROLE, MAX_DOWNLOAD_SIZE) {
            Ok(snapshot_bytes) => {
                let signed_snapshot = serde_json::from_slice(&snapshot_bytes).map_err(|source| {
                    Error::ParseMetadata {
                        role: CANONICAL_SNAPSHOT_ROLE.to_owned(),
                        source,
                    }
                })?;
                repo.set_snapshot(signed_snapshot);
            }
            Err(err) if err.is_meta_not_found() => {
                debug!("no cached snapshot; assuming the server manages it");
            }
            Err(err) => return Err(err),
        }

        self.repo = Some(repo);
        Ok(())
    }

    /// Pulls and verifies timestamp, snapshot, targets and delegations.
    fn pull(&mut self) -> Result<()> {
        let repo = self
            .repo
            .as_mut()
            .context(error::RepoNotInitializedSnafu)?;
        TufClient {
            repo,
            remote: self.remote.as_ref(),
            cache: &self.local,
        }
        .update()
    }

    /// Publishes the staged changelist: pull (or local bootstrap for a new
    /// repo), apply, re-sign, push in one round trip, then drain the list.
    pub fn publish(&mut self) -> Result<()> {
        let outcome = self.publish_inner();
        if outcome.is_err() {
            // A partially mutated or unverified repository must not leak
            // into later operations.
            self.repo = None;
        }
        outcome
    }

    fn publish_inner(&mut self) -> Result<()> {
        let mut force_root = false;
        match self.bootstrap_client() {
            Ok(()) => self.pull()?,
            Err(err) if err.is_meta_not_found() => {
                // The server has no trust data yet: load ours from disk and
                // make sure the initial root is part of the push.
                self.bootstrap_repo().map_err(|err| match err {
                    Error::MetaNotFound { role } if role == CANONICAL_ROOT_ROLE => {
                        Error::RepositoryNotExist
                    }
                    other => other,
                })?;
                force_root = true;
            }
            Err(err) => return Err(err),
        }

        let changelist = self.changelist()?;
        let repo = self
            .repo
            .as_mut()
            .context(error::RepoNotInitializedSnafu)?;
        apply::apply_changelist(repo, &changelist)?;

        let mut updated: HashMap<String, Vec<u8>> = HashMap::new();

        if repo.root_near_expiry() {
            repo.touch(CANONICAL_ROOT_ROLE);
        }
        if force_root || repo.is_dirty(CANONICAL_ROOT_ROLE) {
            updated.insert(
                CANONICAL_ROOT_ROLE.to_owned(),
                repo.sign_root(default_expires(RoleType::Root), &self.crypto)?,
            );
        }

        // The top-level targets role is always part of a push; dirty
        // delegated roles ride along.
        let mut roles_to_push = vec![CANONICAL_TARGETS_ROLE.to_owned()];
        for role in repo.targets.keys() {
            if role != CANONICAL_TARGETS_ROLE && repo.is_dirty(role) {
                roles_to_push.push(role.clone());
            }
        }
        for role in roles_to_push {
            let bytes = repo.sign_targets(&role, default_expires(RoleType::Targets), &self.crypto)?;
            updated.insert(role, bytes);
        }

        // A repository initialized with a server-managed snapshot has no
        // snapshot object yet; a key rotation may have given us a local
        // snapshot key since, so initialize one.
        if repo.snapshot.is_none() {
            repo.init_snapshot()?;
        }
        match repo.sign_snapshot(default_expires(RoleType::Snapshot), &self.crypto) {
            Ok(bytes) => {
                updated.insert(CANONICAL_SNAPSHOT_ROLE.to_owned(), bytes);
            }
            Err(Error::NoKeys { .. }) => {
                debug!("no local snapshot key; assuming the server signs the snapshot");
            }
            Err(Error::NoSuchRole { .. }) => {
                return error::BadHierarchySnafu {
                    reason: "root does not designate a snapshot role",
                }
                .fail()
            }
            Err(err) => return Err(err),
        }

        self.remote.set_multi_meta(&updated)?;

        for (role, bytes) in &updated {
            if let Err(err) = self.local.set_meta(role, bytes) {
                warn!("unable to cache {} metadata locally: {}", role, err);
            }
        }
        if let Err(err) = changelist.clear() {
            warn!(
                "unable to clear the changelist at {}: {}",
                self.changelist_dir.display(),
                err
            );
        }
        Ok(())
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Pulls the repository and lists the signed target set, walking roles
    /// in priority order with first-occurrence-wins shadowing.
    pub fn list_targets(&mut self, roles: &[&str]) -> Result<Vec<TargetWithRole>> {
        self.bootstrap_client()?;
        self.pull()?;
        let repo = self
            .repo
            .as_ref()
            .context(error::RepoNotInitializedSnafu)?;
        let roles: Vec<String> = roles.iter().map(|role| (*role).to_owned()).collect();
        Ok(repo
            .walk_targets(&roles)
            .into_iter()
            .map(|(name, meta, role)| TargetWithRole {
                target: Target {
                    name,
                    length: meta.length,
                    hashes: meta.hashes,
                },
                role,
            })
            .collect())
    }

    /// Pulls the repository and returns the winning occurrence of `name`,
    /// or [`Error::NoTrustData`] if no visited role signs it.
    pub fn get_target_by_name(&mut self, name: &str, roles: &[&str]) -> Result<TargetWithRole> {
        self.list_targets(roles)?
            .into_iter()
            .find(|found| found.target.name == name)
            .context(error::NoTrustDataSnafu { name })
    }

    /// Removes every local artifact of this GUN: cached metadata, the
    /// changelist, and its pinned certificates.
    pub fn delete_trust_data(&mut self) -> Result<()> {
        let tuf_dir = self.base_dir.join("tuf").join(&self.gun);
        match std::fs::remove_dir_all(&tuf_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).context(error::FileRemoveSnafu { path: tuf_dir }),
        }
        self.cert_manager.remove_by_cn(&self.gun)?;
        self.repo = None;
        Ok(())
    }
}
