// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(clippy::used_underscore_binding)]

//! Provides the signed metadata objects: root, targets (with delegations),
//! snapshot and timestamp, plus the key and byte-encoding types they are
//! built from.

mod de;
pub mod decoded;
mod error;
pub mod key;

pub use crate::schema::error::{Error, Result};

use crate::schema::decoded::{Base64, Decoded, Hex};
use crate::schema::key::Key;
use chrono::{DateTime, Utc};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, Context, SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// The root role name.
pub const CANONICAL_ROOT_ROLE: &str = "root";
/// The top-level targets role name; also the root of the delegation tree.
pub const CANONICAL_TARGETS_ROLE: &str = "targets";
/// The snapshot role name.
pub const CANONICAL_SNAPSHOT_ROLE: &str = "snapshot";
/// The timestamp role name.
pub const CANONICAL_TIMESTAMP_ROLE: &str = "timestamp";

/// True if `name` is a syntactically valid delegated role name: a
/// `/`-separated path under `targets` whose segments are non-empty and use
/// a conservative character set.
pub fn is_delegation(name: &str) -> bool {
    let mut parts = name.split('/');
    if parts.next() != Some(CANONICAL_TARGETS_ROLE) {
        return false;
    }
    let mut seen_any = false;
    for part in parts {
        seen_any = true;
        if part.is_empty()
            || !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return false;
        }
    }
    seen_any
}

/// True if `name` may hold targets: the top-level targets role or any
/// delegation.
pub fn is_valid_targets_role(name: &str) -> bool {
    name == CANONICAL_TARGETS_ROLE || is_delegation(name)
}

/// The parent of a delegated role: its name with the final `/…` segment
/// stripped. `targets/a/b` is parented by `targets/a`, which is parented by
/// `targets`.
pub fn parent_role(name: &str) -> Option<&str> {
    if !is_delegation(name) {
        return None;
    }
    name.rfind('/').map(|idx| &name[..idx])
}

/// The type of metadata role. Serializes as the canonical lowercase role
/// name, which is how the `roles` map of root metadata is keyed.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    /// The root role delegates trust to specific keys trusted for all other
    /// roles used in the system.
    Root,
    /// The targets role's signature indicates which target files are trusted
    /// by clients.
    Targets,
    /// The snapshot role pins the byte-exact form of every extant targets
    /// role and of root.
    Snapshot,
    /// The timestamp role is frequently re-signed by the server to limit how
    /// long a client can be kept unaware of new snapshots.
    Timestamp,
}

forward_display_to_serde!(RoleType);
forward_from_str_to_serde!(RoleType);

impl RoleType {
    /// The canonical role name, as used to key metadata stores.
    pub fn name(self) -> &'static str {
        match self {
            RoleType::Root => CANONICAL_ROOT_ROLE,
            RoleType::Targets => CANONICAL_TARGETS_ROLE,
            RoleType::Snapshot => CANONICAL_SNAPSHOT_ROLE,
            RoleType::Timestamp => CANONICAL_TIMESTAMP_ROLE,
        }
    }

    /// Parses a canonical base role name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            CANONICAL_ROOT_ROLE => Some(RoleType::Root),
            CANONICAL_TARGETS_ROLE => Some(RoleType::Targets),
            CANONICAL_SNAPSHOT_ROLE => Some(RoleType::Snapshot),
            CANONICAL_TIMESTAMP_ROLE => Some(RoleType::Timestamp),
            _ => None,
        }
    }
}

/// Common trait implemented by all roles.
pub trait Role: Serialize {
    /// The type of role this object represents.
    const TYPE: RoleType;

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    fn expires(&self) -> DateTime<Utc>;

    /// An integer that is greater than 0. Clients must not replace a
    /// metadata file with a version number less than the one currently
    /// trusted.
    fn version(&self) -> u64;

    /// A deterministic JSON serialization used as the byte sequence that is
    /// signed and digested for this role.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        canonical_json(self, "role")
    }
}

/// Serializes any value in canonical JSON form: sorted keys, no optional
/// whitespace, normalized numbers.
pub fn canonical_json<T>(value: &T, what: &str) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut data = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .context(error::JsonSerializationSnafu { what })?;
    Ok(data)
}

/// A signed metadata object.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

/// A signature and the key ID that made it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The ID of the key that made this signature.
    pub keyid: Decoded<Hex>,
    /// The signature method: `ecdsa`, `rsapss`, or `ed25519`.
    pub method: String,
    /// The base64-encoded signature of the canonical JSON form of the role.
    pub sig: Decoded<Base64>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The root metadata. It declares the key set and signature threshold of
/// every base role; revocation and replacement of role keys is done by
/// changing this file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "Root")]
pub struct Root {
    /// An integer that is greater than 0.
    pub version: u64,

    /// Determines when this metadata should be considered expired.
    pub expires: DateTime<Utc>,

    /// Every public key referenced by a base role, keyed by key ID. The key
    /// ID of every entry is validated during deserialization.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The key IDs and signature threshold of each base role.
    pub roles: HashMap<RoleType, RoleKeys>,

    /// Extra arguments found during deserialization, preserved so that
    /// signatures over this object still verify.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// The key IDs used for a role and the threshold of signatures required to
/// validate it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// The key IDs used for the role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: u64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl RoleKeys {
    /// A role record with the given key IDs and threshold.
    pub fn new(keyids: Vec<Decoded<Hex>>, threshold: u64) -> Self {
        Self {
            keyids,
            threshold,
            _extra: HashMap::new(),
        }
    }
}

impl Root {
    /// Installs `keys` as the complete key set for `role`, replacing any
    /// previous binding and dropping key objects no base role references
    /// anymore. The role's threshold is preserved.
    pub fn set_role_keys(&mut self, role: RoleType, keys: Vec<(Decoded<Hex>, Key)>) {
        let keyids = keys.iter().map(|(id, _)| id.clone()).collect();
        for (id, key) in keys {
            self.keys.insert(id, key);
        }
        match self.roles.get_mut(&role) {
            Some(record) => record.keyids = keyids,
            None => {
                self.roles.insert(role, RoleKeys::new(keyids, 1));
            }
        }
        self.prune_unused_keys();
    }

    /// Drops key objects that no base role references.
    fn prune_unused_keys(&mut self) {
        let referenced: Vec<Decoded<Hex>> = self
            .roles
            .values()
            .flat_map(|r| r.keyids.iter().cloned())
            .collect();
        self.keys.retain(|id, _| referenced.contains(id));
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A targets role: a mapping of target names to content digests, plus the
/// delegations this role makes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "Targets")]
pub struct Targets {
    /// An integer that is greater than 0.
    pub version: u64,

    /// Determines when this metadata should be considered expired.
    pub expires: DateTime<Utc>,

    /// The targets signed by this role.
    pub targets: HashMap<String, FileMeta>,

    /// Subsets of the target namespace for which responsibility is delegated
    /// to other roles.
    #[serde(default)]
    pub delegations: Delegations,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// The length and hashes describing a target or a metadata file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileMeta {
    /// The length in bytes.
    pub length: u64,

    /// One or more digests of the content, keyed by algorithm. `sha256` is
    /// required.
    pub hashes: HashMap<String, Decoded<Hex>>,

    /// Opaque application data carried alongside the digest.
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl FileMeta {
    /// Digests a byte stream into `{length, hashes}` form.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut digest = Context::new(&SHA256);
        let mut buf = [0; 8 * 1024];
        let mut length = 0;
        loop {
            match reader
                .read(&mut buf)
                .context(error::FileReadSnafu { path: "<reader>" })?
            {
                0 => break,
                n => {
                    digest.update(&buf[..n]);
                    length += n as u64;
                }
            }
        }
        let mut hashes = HashMap::new();
        hashes.insert(
            "sha256".to_string(),
            digest.finish().as_ref().to_vec().into(),
        );
        Ok(FileMeta {
            length,
            hashes,
            custom: HashMap::new(),
            _extra: HashMap::new(),
        })
    }

    /// Digests a file on disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        ensure!(path.is_file(), error::TargetNotAFileSnafu { path });
        let file = File::open(path).context(error::FileOpenSnafu { path })?;
        Self::from_reader(file)
    }

    /// Digests a byte slice already held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hashes = HashMap::new();
        hashes.insert(
            "sha256".to_string(),
            digest(&SHA256, bytes).as_ref().to_vec().into(),
        );
        FileMeta {
            length: bytes.len() as u64,
            hashes,
            custom: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// The sha256 digest, if present.
    pub fn sha256(&self) -> Option<&[u8]> {
        self.hashes.get("sha256").map(|h| h.as_ref())
    }
}

impl Targets {
    /// Finds the delegated role called `name` among this role's immediate
    /// delegations.
    pub fn delegated_role(&self, name: &str) -> Option<&DelegatedRole> {
        self.delegations.role(name)
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// The keys and roles a targets role delegates to.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Delegations {
    /// The public keys used by this role's delegations, keyed by key ID.
    /// A key shared by several delegations appears once.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The list of delegated roles, in delegation priority order.
    pub roles: Vec<DelegatedRole>,
}

impl Delegations {
    /// Looks up an immediate delegation by name.
    pub fn role(&self, name: &str) -> Option<&DelegatedRole> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Looks up an immediate delegation by name, mutably.
    pub fn role_mut(&mut self, name: &str) -> Option<&mut DelegatedRole> {
        self.roles.iter_mut().find(|r| r.name == name)
    }

    /// Drops keys that no remaining delegation references.
    pub fn prune_unused_keys(&mut self) {
        let referenced: Vec<Decoded<Hex>> = self
            .roles
            .iter()
            .flat_map(|r| r.keyids.iter().cloned())
            .collect();
        self.keys.retain(|id, _| referenced.contains(id));
    }
}

/// A role delegated a slice of the target namespace by a targets role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DelegatedRole {
    /// The full name of the delegated role, e.g. `targets/releases`.
    pub name: String,

    /// The key IDs used by this role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: u64,

    /// Path prefixes this role is trusted for. An empty string matches every
    /// path. Mutually exclusive with `path_hash_prefixes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,

    /// Hex prefixes of the SHA-256 digest of trusted paths, used to bin
    /// large target sets. Mutually exclusive with `paths`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_hash_prefixes: Option<Vec<String>>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl DelegatedRole {
    /// True when both `paths` and `path_hash_prefixes` are populated, which
    /// no valid role may be.
    pub fn paths_conflict(&self) -> bool {
        let has_paths = self.paths.as_ref().map_or(false, |p| !p.is_empty());
        let has_prefixes = self
            .path_hash_prefixes
            .as_ref()
            .map_or(false, |p| !p.is_empty());
        has_paths && has_prefixes
    }

    /// True when `path` is inside this role's scope: it starts with one of
    /// the role's path prefixes, or its digest starts with one of the
    /// role's path hash prefixes.
    pub fn check_path(&self, path: &str) -> bool {
        if let Some(paths) = &self.paths {
            if paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                return true;
            }
        }
        if let Some(prefixes) = &self.path_hash_prefixes {
            let hashed = hex::encode(digest(&SHA256, path.as_bytes()));
            if prefixes.iter().any(|prefix| hashed.starts_with(prefix.as_str())) {
                return true;
            }
        }
        false
    }

    /// This role's record in `{keyids, threshold}` form.
    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys::new(self.keyids.clone(), self.threshold)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The snapshot metadata: the byte-exact form (length and hashes) of root
/// and of every extant targets role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "Snapshot")]
pub struct Snapshot {
    /// An integer that is greater than 0.
    pub version: u64,

    /// Determines when this metadata should be considered expired.
    pub expires: DateTime<Utc>,

    /// The pinned metadata files, keyed by role name.
    pub meta: HashMap<String, FileMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// The timestamp metadata: the byte-exact form of the current snapshot.
/// Always produced by the server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "Timestamp")]
pub struct Timestamp {
    /// An integer that is greater than 0.
    pub version: u64,

    /// Determines when this metadata should be considered expired.
    pub expires: DateTime<Utc>,

    /// The pinned snapshot, keyed by role name.
    pub meta: HashMap<String, FileMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> u64 {
        self.version
    }
}
