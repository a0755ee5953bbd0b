// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the in-memory key database: the association of role names to
//! authorized key IDs and thresholds, together with the key objects
//! themselves. Rebuilt from root metadata on every bootstrap and extended
//! with delegation records as targets metadata is loaded.

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{is_valid_targets_role, RoleKeys, Root, RoleType, Targets};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;

/// Role records and key objects for one repository.
#[derive(Debug, Clone, Default)]
pub struct KeyDb {
    keys: HashMap<Decoded<Hex>, Key>,
    roles: HashMap<String, RoleKeys>,
}

impl KeyDb {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// A database seeded from root metadata: every declared key plus a
    /// record per base role.
    pub fn from_root(root: &Root) -> Result<Self> {
        let mut db = Self::new();
        for key in root.keys.values() {
            db.add_key(key.clone())?;
        }
        for (role, record) in &root.roles {
            db.roles.insert(role.name().to_owned(), record.clone());
        }
        Ok(db)
    }

    /// Adds a key object, returning its ID.
    pub fn add_key(&mut self, key: Key) -> Result<Decoded<Hex>> {
        let key_id = key.key_id().context(error::SchemaSnafu)?;
        self.keys.insert(key_id.clone(), key);
        Ok(key_id)
    }

    /// Installs (or replaces) the record for `role`. The role name must be a
    /// base role or a delegation, and every key ID must already be known.
    pub fn add_role(&mut self, role: &str, record: RoleKeys) -> Result<()> {
        ensure!(
            RoleType::from_name(role).is_some() || is_valid_targets_role(role),
            error::InvalidRoleSnafu {
                role,
                reason: "not a base role or delegation",
            }
        );
        for keyid in &record.keyids {
            ensure!(
                self.keys.contains_key(keyid),
                error::InvalidRoleSnafu {
                    role,
                    reason: "role references an unknown key",
                }
            );
        }
        self.roles.insert(role.to_owned(), record);
        Ok(())
    }

    /// Adds every delegation record (and delegation key) declared by a
    /// targets role.
    pub fn load_delegations(&mut self, targets: &Targets) -> Result<()> {
        for key in targets.delegations.keys.values() {
            self.add_key(key.clone())?;
        }
        for role in &targets.delegations.roles {
            self.add_role(&role.name, role.role_keys())?;
        }
        Ok(())
    }

    /// Removes the record for `role`.
    pub fn remove_role(&mut self, role: &str) {
        self.roles.remove(role);
    }

    /// The record for `role`, if present.
    pub fn role(&self, role: &str) -> Option<&RoleKeys> {
        self.roles.get(role)
    }

    /// The key object with the given ID, if present.
    pub fn key(&self, keyid: &Decoded<Hex>) -> Option<&Key> {
        self.keys.get(keyid)
    }
}
