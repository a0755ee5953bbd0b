// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replays staged changes against the in-memory repository. Dispatch is on
//! `(kind, action)`; the first failing change aborts the replay and the
//! caller discards the repository.

use crate::changelist::{
    Change, ChangeAction, ChangeKind, Changelist, RootRoleChange, TufDelegation,
};
use crate::error::{self, Result};
use crate::repo::Repo;
use crate::schema::{is_delegation, is_valid_targets_role, parent_role, FileMeta};
use log::debug;
use snafu::{ensure, OptionExt, ResultExt};

/// Replays every change in insertion order. The first error aborts the
/// replay, leaving the repository partially mutated; callers treat that as
/// fatal and throw the repository away.
pub(crate) fn apply_changelist(repo: &mut Repo, changelist: &dyn Changelist) -> Result<()> {
    for change in changelist.list()? {
        apply_change(repo, &change)?;
    }
    Ok(())
}

/// Applies one change to the repository.
pub(crate) fn apply_change(repo: &mut Repo, change: &Change) -> Result<()> {
    debug!(
        "applying {} {} change to scope '{}' path '{}'",
        change.action, change.kind, change.scope, change.path
    );
    match change.kind {
        ChangeKind::Target => apply_target_change(repo, change),
        ChangeKind::Delegation => apply_delegation_change(repo, change),
        ChangeKind::RootRole => apply_root_role_change(repo, change),
    }
}

/// Ensures the targets role named `scope` is materialized, auto-initializing
/// a delegated role whose delegation edge already exists.
fn materialize_targets_role(repo: &mut Repo, scope: &str) -> Result<()> {
    if repo.targets.contains_key(scope) {
        return Ok(());
    }
    ensure!(
        is_delegation(scope) && repo.delegation_exists(scope),
        error::InvalidRoleSnafu {
            role: scope,
            reason: "role does not exist in the repository",
        }
    );
    repo.init_targets(scope)
}

fn apply_target_change(repo: &mut Repo, change: &Change) -> Result<()> {
    ensure!(
        is_valid_targets_role(&change.scope),
        error::InvalidRoleSnafu {
            role: &change.scope,
            reason: "cannot hold targets",
        }
    );
    match change.action {
        ChangeAction::Create => {
            materialize_targets_role(repo, &change.scope)?;
            let meta: FileMeta = serde_json::from_slice(&change.content)
                .context(error::ChangeContentSnafu { kind: "target" })?;
            repo.add_target_to_role(&change.scope, &change.path, meta)
        }
        ChangeAction::Delete => repo.remove_target_from_role(&change.scope, &change.path),
        ChangeAction::Update => error::UnknownChangeActionSnafu {
            action: "update targets",
        }
        .fail(),
    }
}

fn apply_delegation_change(repo: &mut Repo, change: &Change) -> Result<()> {
    let scope = change.scope.as_str();
    match change.action {
        ChangeAction::Create => {
            ensure!(
                is_delegation(scope),
                error::InvalidRoleSnafu {
                    role: scope,
                    reason: "invalid delegation role name",
                }
            );
            // The parent may itself be a delegation staged earlier in the
            // same list whose targets metadata was never initialized.
            if let Some(parent) = parent_role(scope) {
                if parent != crate::schema::CANONICAL_TARGETS_ROLE
                    && !repo.targets.contains_key(parent)
                    && repo.delegation_exists(parent)
                {
                    repo.init_targets(parent)?;
                }
            }
            let td: TufDelegation = serde_json::from_slice(&change.content)
                .context(error::ChangeContentSnafu { kind: "delegation" })?;
            let paths = if td.add_paths.is_empty() {
                None
            } else {
                Some(td.add_paths)
            };
            let prefixes = if td.add_path_hash_prefixes.is_empty() {
                None
            } else {
                Some(td.add_path_hash_prefixes)
            };
            repo.create_delegation(scope, td.add_keys, td.new_threshold, paths, prefixes)
        }
        ChangeAction::Update => {
            ensure!(
                repo.delegation_exists(scope),
                error::NoSuchRoleSnafu { role: scope }
            );
            let td: TufDelegation = serde_json::from_slice(&change.content)
                .context(error::ChangeContentSnafu { kind: "delegation" })?;
            let parent = parent_role(scope).context(error::InvalidRoleSnafu {
                role: scope,
                reason: "invalid delegation role name",
            })?;

            // Capture the parent so a failed post-condition rolls the whole
            // mutation back.
            let saved = repo
                .targets
                .get(parent)
                .context(error::NoSuchRoleSnafu { role: parent })?
                .clone();
            let was_dirty = repo.is_dirty(parent);

            let outcome = repo
                .update_delegation_keys(scope, td.add_keys, &td.remove_keys, td.new_threshold)
                .and_then(|()| {
                    repo.update_delegation_paths(
                        scope,
                        &td.add_paths,
                        &td.remove_paths,
                        &td.add_path_hash_prefixes,
                        &td.remove_path_hash_prefixes,
                        td.clear_all_paths,
                    )
                });
            if let Err(err) = outcome {
                debug!("rolling back delegation update for '{}': {}", scope, err);
                repo.restore_targets(parent, saved)?;
                if !was_dirty {
                    repo.clear_dirty(parent);
                }
                return Err(err);
            }
            Ok(())
        }
        ChangeAction::Delete => repo.delete_delegation(scope),
    }
}

fn apply_root_role_change(repo: &mut Repo, change: &Change) -> Result<()> {
    ensure!(
        change.action == ChangeAction::Create,
        error::UnknownChangeActionSnafu {
            action: format!("{} root role", change.action),
        }
    );
    let payload: RootRoleChange = serde_json::from_slice(&change.content)
        .context(error::ChangeContentSnafu { kind: "root role" })?;
    repo.set_root_role_keys(payload.role, payload.keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelist::MemChangelist;
    use crate::crypto::KeyAlgorithm;
    use crate::repo::test_utils::empty_repo;
    use crate::schema::CANONICAL_TARGETS_ROLE;
    use crate::Error;

    fn file_meta_json() -> Vec<u8> {
        serde_json::to_vec(&FileMeta::from_bytes(b"")).unwrap()
    }

    fn delegation_json(td: &TufDelegation) -> Vec<u8> {
        serde_json::to_vec(td).unwrap()
    }

    #[test]
    fn target_create_then_delete() {
        let (mut repo, _service) = empty_repo();
        let meta = FileMeta::from_bytes(b"");

        let add = Change::new(
            ChangeAction::Create,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "latest",
            file_meta_json(),
        );
        apply_change(&mut repo, &add).unwrap();
        assert_eq!(
            repo.targets[CANONICAL_TARGETS_ROLE].signed.targets["latest"],
            meta
        );

        let remove = Change::new(
            ChangeAction::Delete,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "latest",
            Vec::new(),
        );
        apply_change(&mut repo, &remove).unwrap();
        assert!(!repo.targets[CANONICAL_TARGETS_ROLE]
            .signed
            .targets
            .contains_key("latest"));
    }

    #[test]
    fn changelist_add_then_remove_cancels() {
        let (mut repo, _service) = empty_repo();
        let list = MemChangelist::new();
        list.add(Change::new(
            ChangeAction::Create,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "latest",
            file_meta_json(),
        ))
        .unwrap();
        list.add(Change::new(
            ChangeAction::Delete,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "latest",
            Vec::new(),
        ))
        .unwrap();

        apply_changelist(&mut repo, &list).unwrap();
        assert!(!repo.targets[CANONICAL_TARGETS_ROLE]
            .signed
            .targets
            .contains_key("latest"));
    }

    #[test]
    fn replay_is_deterministic() {
        let list = MemChangelist::new();
        list.add(Change::new(
            ChangeAction::Create,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "a",
            file_meta_json(),
        ))
        .unwrap();
        list.add(Change::new(
            ChangeAction::Create,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "b",
            file_meta_json(),
        ))
        .unwrap();
        list.add(Change::new(
            ChangeAction::Delete,
            CANONICAL_TARGETS_ROLE,
            ChangeKind::Target,
            "a",
            Vec::new(),
        ))
        .unwrap();

        let (mut one, _s1) = empty_repo();
        let (mut two, _s2) = empty_repo();
        apply_changelist(&mut one, &list).unwrap();
        apply_changelist(&mut two, &list).unwrap();
        assert_eq!(
            one.targets[CANONICAL_TARGETS_ROLE].signed.targets,
            two.targets[CANONICAL_TARGETS_ROLE].signed.targets
        );
    }

    #[test]
    fn delegation_create_and_delete() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let key_id = key.key_id().unwrap();

        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let create = Change::new(
            ChangeAction::Create,
            "targets/level1",
            ChangeKind::Delegation,
            "",
            delegation_json(&td),
        );
        apply_change(&mut repo, &create).unwrap();

        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert_eq!(tgts.delegations.roles.len(), 1);
        assert_eq!(tgts.delegations.keys.len(), 1);
        assert!(tgts.delegations.keys.contains_key(&key_id));
        let role = &tgts.delegations.roles[0];
        assert_eq!(role.name, "targets/level1");
        assert_eq!(role.keyids, vec![key_id]);
        assert_eq!(role.paths.as_deref(), Some(&["level1".to_string()][..]));

        let delete = Change::new(
            ChangeAction::Delete,
            "targets/level1",
            ChangeKind::Delegation,
            "",
            Vec::new(),
        );
        apply_change(&mut repo, &delete).unwrap();
        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert!(tgts.delegations.roles.is_empty());
        assert!(tgts.delegations.keys.is_empty());
    }

    #[test]
    fn two_delegations_share_one_key() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();

        for (name, path) in [("targets/level1", "level1"), ("targets/level2", "level2")] {
            let td = TufDelegation {
                new_threshold: 1,
                add_keys: vec![key.clone()],
                add_paths: vec![path.to_string()],
                ..TufDelegation::default()
            };
            apply_change(
                &mut repo,
                &Change::new(
                    ChangeAction::Create,
                    name,
                    ChangeKind::Delegation,
                    "",
                    delegation_json(&td),
                ),
            )
            .unwrap();
        }

        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert_eq!(tgts.delegations.roles.len(), 2);
        assert_eq!(tgts.delegations.keys.len(), 1);

        // deleting one delegation keeps the shared key
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Delete,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                Vec::new(),
            ),
        )
        .unwrap();
        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert_eq!(tgts.delegations.roles.len(), 1);
        assert_eq!(tgts.delegations.keys.len(), 1);

        // deleting the other cleans it up
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Delete,
                "targets/level2",
                ChangeKind::Delegation,
                "",
                Vec::new(),
            ),
        )
        .unwrap();
        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert!(tgts.delegations.roles.is_empty());
        assert!(tgts.delegations.keys.is_empty());
    }

    #[test]
    fn delegation_update_swaps_keys() {
        let (mut repo, service) = empty_repo();
        let first = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let first_id = first.key_id().unwrap();

        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![first],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        let second = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let second_id = second.key_id().unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![second],
            remove_keys: vec![first_id],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Update,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        assert_eq!(tgts.delegations.roles.len(), 1);
        assert_eq!(tgts.delegations.keys.len(), 1);
        assert!(tgts.delegations.keys.contains_key(&second_id));
        let role = &tgts.delegations.roles[0];
        assert_eq!(role.keyids, vec![second_id]);
        assert_eq!(role.paths.as_deref(), Some(&["level1".to_string()][..]));
    }

    #[test]
    fn update_of_missing_delegation_is_no_such_role() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Update,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(matches!(result, Err(Error::NoSuchRole { .. })));
    }

    #[test]
    fn create_of_existing_delegation_is_invalid_role() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let create = Change::new(
            ChangeAction::Create,
            "targets/level1",
            ChangeKind::Delegation,
            "",
            delegation_json(&td),
        );
        apply_change(&mut repo, &create).unwrap();
        assert!(matches!(
            apply_change(&mut repo, &create),
            Err(Error::InvalidRole { .. })
        ));
    }

    #[test]
    fn invalid_delegation_name_is_rejected() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "bad role",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(result.is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let mut payload = delegation_json(&td);
        payload.remove(0);
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                payload,
            ),
        );
        assert!(matches!(result, Err(Error::ChangeContent { .. })));
    }

    #[test]
    fn update_action_on_target_is_rejected() {
        let (mut repo, _service) = empty_repo();
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Update,
                CANONICAL_TARGETS_ROLE,
                ChangeKind::Target,
                "latest",
                file_meta_json(),
            ),
        );
        assert!(matches!(result, Err(Error::UnknownChangeAction { .. })));
    }

    #[test]
    fn conflicting_scope_update_rolls_back() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key.clone()],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        // a role with paths may not gain hash prefixes
        let second = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let second_id = second.key_id().unwrap();
        let td = TufDelegation {
            add_keys: vec![second],
            add_path_hash_prefixes: vec!["abc".to_string()],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Update,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(matches!(result, Err(Error::PathConflict { .. })));

        // the failed update must leave no trace, including its key adds
        let tgts = &repo.targets[CANONICAL_TARGETS_ROLE].signed;
        let role = tgts.delegations.role("targets/level1").unwrap();
        assert_eq!(role.paths.as_deref(), Some(&["level1".to_string()][..]));
        assert_eq!(role.path_hash_prefixes, None);
        assert!(!role.keyids.contains(&second_id));
        assert!(!tgts.delegations.keys.contains_key(&second_id));
    }

    #[test]
    fn conflicting_prefix_update_rolls_back() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_path_hash_prefixes: vec!["abc".to_string()],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        let td = TufDelegation {
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Update,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(matches!(result, Err(Error::PathConflict { .. })));
    }

    #[test]
    fn create_with_both_scopes_is_rejected() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            add_path_hash_prefixes: vec!["abc".to_string()],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(matches!(result, Err(Error::PathConflict { .. })));
    }

    #[test]
    fn nested_delegation_auto_initializes_parent() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();

        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key.clone()],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        // no explicit init_targets("targets/level1") here: applying the
        // nested create materializes it
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key.clone()],
            add_paths: vec!["level1/level2".to_string()],
            ..TufDelegation::default()
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1/level2",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        )
        .unwrap();

        let key_id = key.key_id().unwrap();
        let tgts = &repo.targets["targets/level1"].signed;
        assert_eq!(tgts.delegations.roles.len(), 1);
        assert!(tgts.delegations.keys.contains_key(&key_id));
        let role = &tgts.delegations.roles[0];
        assert_eq!(role.name, "targets/level1/level2");
        assert_eq!(
            role.paths.as_deref(),
            Some(&["level1/level2".to_string()][..])
        );
    }

    #[test]
    fn delegation_without_parent_edge_fails() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1/level2", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            ..TufDelegation::default()
        };
        let result = apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                "targets/level1/level2",
                ChangeKind::Delegation,
                "",
                delegation_json(&td),
            ),
        );
        assert!(matches!(result, Err(Error::InvalidRole { .. })));
    }

    #[test]
    fn target_create_in_staged_delegation_auto_initializes() {
        let (mut repo, service) = empty_repo();
        let key = service
            .create("targets/level1", KeyAlgorithm::Ed25519)
            .unwrap();
        let td = TufDelegation {
            new_threshold: 1,
            add_keys: vec![key],
            add_paths: vec!["level1".to_string()],
            ..TufDelegation::default()
        };
        let list = MemChangelist::new();
        list.add(Change::new(
            ChangeAction::Create,
            "targets/level1",
            ChangeKind::Delegation,
            "",
            delegation_json(&td),
        ))
        .unwrap();
        let meta = FileMeta::from_bytes(b"inner");
        list.add(Change::new(
            ChangeAction::Create,
            "targets/level1",
            ChangeKind::Target,
            "level1/app",
            serde_json::to_vec(&meta).unwrap(),
        ))
        .unwrap();

        apply_changelist(&mut repo, &list).unwrap();
        assert_eq!(
            repo.targets["targets/level1"].signed.targets["level1/app"],
            meta
        );
    }

    #[test]
    fn root_role_change_installs_new_keys() {
        let (mut repo, service) = empty_repo();
        let old_ids = repo.root.as_ref().unwrap().signed.roles
            [&crate::schema::RoleType::Snapshot]
            .keyids
            .clone();
        let new_key = service.create("snapshot", KeyAlgorithm::Ecdsa).unwrap();
        let new_id = new_key.key_id().unwrap();

        let payload = RootRoleChange {
            role: crate::schema::RoleType::Snapshot,
            keys: vec![new_key],
        };
        apply_change(
            &mut repo,
            &Change::new(
                ChangeAction::Create,
                crate::changelist::SCOPE_ROOT,
                ChangeKind::RootRole,
                "snapshot",
                serde_json::to_vec(&payload).unwrap(),
            ),
        )
        .unwrap();

        let root = &repo.root.as_ref().unwrap().signed;
        let record = &root.roles[&crate::schema::RoleType::Snapshot];
        assert_eq!(record.keyids, vec![new_id.clone()]);
        assert!(root.keys.contains_key(&new_id));
        for old in &old_ids {
            assert!(!root.keys.contains_key(old));
        }
        assert!(repo.is_dirty("root"));
    }
}
