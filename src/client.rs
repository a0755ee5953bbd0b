// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the pull client: downloads timestamp, snapshot, targets and
//! reachable delegated targets in order, enforcing declared lengths,
//! pinned hashes, signature thresholds, expiry and version monotonicity at
//! every step. Root is fetched and anchored separately during bootstrap.

use crate::error::{self, Result};
use crate::repo::Repo;
use crate::schema::{
    FileMeta, Signed, Snapshot, Targets, Timestamp, CANONICAL_SNAPSHOT_ROLE,
    CANONICAL_TARGETS_ROLE, CANONICAL_TIMESTAMP_ROLE,
};
use crate::store::{MetadataStore, RemoteStore};
use crate::verify;
use crate::MAX_DOWNLOAD_SIZE;
use log::{debug, warn};
use ring::digest::{digest, SHA256};
use snafu::{ensure, OptionExt};

/// Pulls and verifies the mutable half of a repository, caching each
/// verified blob in the local store.
pub(crate) struct TufClient<'a> {
    pub(crate) repo: &'a mut Repo,
    pub(crate) remote: &'a dyn RemoteStore,
    pub(crate) cache: &'a dyn MetadataStore,
}

impl TufClient<'_> {
    /// Downloads timestamp, snapshot, targets, and every delegated targets
    /// role reachable from `targets` that the snapshot lists.
    pub(crate) fn update(&mut self) -> Result<()> {
        self.update_timestamp()?;
        self.update_snapshot()?;
        self.update_targets()?;
        self.update_delegations()
    }

    fn update_timestamp(&mut self) -> Result<()> {
        let bytes = self
            .remote
            .get_meta(CANONICAL_TIMESTAMP_ROLE, MAX_DOWNLOAD_SIZE)?;
        let signed: Signed<Timestamp> = serde_json::from_slice(&bytes).map_err(|source| {
            error::Error::ParseMetadata {
                role: CANONICAL_TIMESTAMP_ROLE.to_owned(),
                source,
            }
        })?;
        verify::verify_meta(&signed, CANONICAL_TIMESTAMP_ROLE, &self.repo.keydb)?;
        if let Some(current) = &self.repo.timestamp {
            verify::check_version(
                CANONICAL_TIMESTAMP_ROLE,
                signed.signed.version,
                current.signed.version,
            )?;
        }
        self.cache_verified(CANONICAL_TIMESTAMP_ROLE, &bytes);
        self.repo.set_timestamp(signed);
        Ok(())
    }

    fn update_snapshot(&mut self) -> Result<()> {
        let meta = self
            .repo
            .timestamp
            .as_ref()
            .and_then(|ts| ts.signed.meta.get(CANONICAL_SNAPSHOT_ROLE))
            .context(error::MetaNotFoundSnafu {
                role: CANONICAL_SNAPSHOT_ROLE,
            })?
            .clone();
        let bytes = self.fetch_pinned(CANONICAL_SNAPSHOT_ROLE, &meta)?;
        let signed: Signed<Snapshot> = serde_json::from_slice(&bytes).map_err(|source| {
            error::Error::ParseMetadata {
                role: CANONICAL_SNAPSHOT_ROLE.to_owned(),
                source,
            }
        })?;
        verify::verify_meta(&signed, CANONICAL_SNAPSHOT_ROLE, &self.repo.keydb)?;
        if let Some(current) = &self.repo.snapshot {
            verify::check_version(
                CANONICAL_SNAPSHOT_ROLE,
                signed.signed.version,
                current.signed.version,
            )?;
        }
        self.cache_verified(CANONICAL_SNAPSHOT_ROLE, &bytes);
        self.repo.set_snapshot(signed);
        Ok(())
    }

    fn update_targets(&mut self) -> Result<()> {
        let signed = self.fetch_targets_role(CANONICAL_TARGETS_ROLE)?;
        self.repo.set_targets(CANONICAL_TARGETS_ROLE, signed)
    }

    /// Walks the delegation tree in pre-order, pulling every delegated
    /// role the snapshot knows about. A delegation without snapshot meta
    /// has never been published and is skipped.
    fn update_delegations(&mut self) -> Result<()> {
        let mut queue: Vec<String> = self
            .delegation_names(CANONICAL_TARGETS_ROLE)
            .into_iter()
            .rev()
            .collect();
        while let Some(role) = queue.pop() {
            if !self.snapshot_has(&role) {
                debug!("delegation '{}' has no published metadata yet", role);
                continue;
            }
            let signed = self.fetch_targets_role(&role)?;
            self.repo.set_targets(&role, signed)?;
            for child in self.delegation_names(&role).into_iter().rev() {
                queue.push(child);
            }
        }
        Ok(())
    }

    fn delegation_names(&self, role: &str) -> Vec<String> {
        self.repo
            .targets
            .get(role)
            .map(|signed| {
                signed
                    .signed
                    .delegations
                    .roles
                    .iter()
                    .map(|child| child.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshot_has(&self, role: &str) -> bool {
        self.repo
            .snapshot
            .as_ref()
            .map_or(false, |snapshot| snapshot.signed.meta.contains_key(role))
    }

    fn fetch_targets_role(&mut self, role: &str) -> Result<Signed<Targets>> {
        let meta = self
            .repo
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.signed.meta.get(role))
            .context(error::MetaNotFoundSnafu { role })?
            .clone();
        let bytes = self.fetch_pinned(role, &meta)?;
        let signed: Signed<Targets> =
            serde_json::from_slice(&bytes).map_err(|source| error::Error::ParseMetadata {
                role: role.to_owned(),
                source,
            })?;
        verify::verify_meta(&signed, role, &self.repo.keydb)?;
        if let Some(current) = self.repo.targets.get(role) {
            verify::check_version(role, signed.signed.version, current.signed.version)?;
        }
        self.cache_verified(role, &bytes);
        Ok(signed)
    }

    /// Downloads a role whose length and hashes are pinned by its parent
    /// manifest, using the checksum-addressed path so intermediate caches
    /// can serve it.
    fn fetch_pinned(&self, role: &str, meta: &FileMeta) -> Result<Vec<u8>> {
        let expected = meta
            .sha256()
            .context(error::MetaNotFoundSnafu { role })?
            .to_vec();
        let bytes = self
            .remote
            .get_meta_by_checksum(role, &hex::encode(&expected), meta.length)?;
        ensure!(
            bytes.len() as u64 <= meta.length,
            error::MaxSizeExceededSnafu {
                max_size: meta.length,
                specifier: "pinned metadata",
            }
        );
        let calculated = digest(&SHA256, &bytes);
        ensure!(
            calculated.as_ref() == expected.as_slice(),
            error::HashMismatchSnafu {
                context: role,
                calculated: hex::encode(calculated),
                expected: hex::encode(&expected),
            }
        );
        Ok(bytes)
    }

    /// Caching a verified blob is best-effort; the pull itself has
    /// succeeded.
    fn cache_verified(&self, role: &str, bytes: &[u8]) {
        if let Err(err) = self.cache.set_meta(role, bytes) {
            warn!("unable to cache {} metadata locally: {}", role, err);
        }
    }
}
