//! Group registry
//!
//! Operates on an owned account snapshot. Callers discard the snapshot when
//! any step fails, so a rejected batch leaves the stored account untouched.

use crate::integrity;
use meshplane_common::{new_id, Account, Error, Group, GroupIssued, Result, User, GROUP_ALL_NAME};
use tracing::debug;

const INTEGRATION_DELETE_DENIED: &str =
    "only service users with admin power can delete integration group";

/// Validate a group against the account and normalize it for storage.
///
/// Assigns an ID to API groups submitted without one, drops duplicate peer
/// entries and stamps the account ID.
pub fn prepare_group(account: &Account, group: &mut Group) -> Result<()> {
    let existing = if group.id.is_empty() {
        None
    } else {
        account.groups.get(&group.id)
    };

    if account.is_group_all(&group.id) {
        return Err(Error::validation("updating group ALL is not allowed"));
    }

    if let Some(current) = existing {
        if current.issued != group.issued {
            return Err(Error::validation(format!(
                "changing the issuer of group {} from {} to {} is not allowed",
                group.id, current.issued, group.issued
            )));
        }
    }

    if group.issued == GroupIssued::Api {
        if group.name.trim().is_empty() {
            return Err(Error::validation("group name shouldn't be empty"));
        }
        if group.name == GROUP_ALL_NAME {
            return Err(Error::validation(format!(
                "group name {} is reserved",
                GROUP_ALL_NAME
            )));
        }

        // Server-assigned IDs and renames must not collide with another API group
        let renamed = existing.map_or(false, |g| g.name != group.name);
        if group.id.is_empty() || renamed {
            let taken = account.groups.values().any(|g| {
                g.id != group.id && g.issued == GroupIssued::Api && g.name == group.name
            });
            if taken {
                return Err(Error::validation(format!(
                    "group with name {} already exists",
                    group.name
                )));
            }
        }
    } else if group.id.is_empty() {
        return Err(Error::validation(format!(
            "{} group without ID set",
            group.issued
        )));
    }

    for peer_id in &group.peers {
        if !account.peers.contains_key(peer_id) {
            return Err(Error::not_found("peer", peer_id.as_str()));
        }
    }

    let mut seen = std::collections::HashSet::new();
    group.peers.retain(|p| seen.insert(p.clone()));

    if group.id.is_empty() {
        group.id = new_id();
    }
    group.account_id = account.id.clone();
    Ok(())
}

/// Validate and write every group, or none of them.
///
/// Groups are validated in order against the account as already updated by
/// the earlier groups of the batch.
pub fn save_groups(account: &mut Account, groups: Vec<Group>) -> Result<Vec<Group>> {
    let mut saved = Vec::with_capacity(groups.len());
    for mut group in groups {
        prepare_group(account, &mut group)?;
        debug!("Staged group {} ({})", group.name, group.id);
        account.groups.insert(group.id.clone(), group.clone());
        saved.push(group);
    }
    Ok(saved)
}

/// Check every deletion rule for one group without removing it
pub fn check_deletable(account: &Account, group_id: &str, actor: &User) -> Result<()> {
    let group = account.get_group(group_id)?;

    if account.is_group_all(group_id) {
        return Err(Error::validation("deleting group ALL is not allowed"));
    }

    if group.issued == GroupIssued::Integration && !actor.is_service_admin() {
        return Err(Error::permission_denied(INTEGRATION_DELETE_DENIED));
    }

    integrity::check_group_deletable(account, group_id)
}

/// Remove one group after checking it may be deleted
pub fn delete_group(account: &mut Account, group_id: &str, actor: &User) -> Result<Group> {
    check_deletable(account, group_id, actor)?;
    account
        .groups
        .remove(group_id)
        .ok_or_else(|| Error::not_found("group", group_id))
}

fn editable_group<'a>(account: &'a mut Account, group_id: &str) -> Result<&'a mut Group> {
    if account.is_group_all(group_id) {
        return Err(Error::validation("updating group ALL is not allowed"));
    }
    account
        .groups
        .get_mut(group_id)
        .ok_or_else(|| Error::not_found("group", group_id))
}

/// Add a peer to a group. Returns false when it was already a member.
pub fn add_peer(account: &mut Account, group_id: &str, peer_id: &str) -> Result<bool> {
    account.get_peer(peer_id)?;
    let group = editable_group(account, group_id)?;
    Ok(group.add_peer(peer_id))
}

/// Remove a peer from a group. Returns false when it was not a member.
pub fn remove_peer(account: &mut Account, group_id: &str, peer_id: &str) -> Result<bool> {
    let group = editable_group(account, group_id)?;
    Ok(group.remove_peer(peer_id))
}

/// Drop a peer from every group it belongs to, returning those group IDs
pub fn remove_peer_everywhere(account: &mut Account, peer_id: &str) -> Vec<String> {
    account
        .groups
        .values_mut()
        .filter_map(|g| g.remove_peer(peer_id).then(|| g.id.clone()))
        .collect()
}

/// Groups whose member list includes the peer
pub fn groups_of_peer<'a>(account: &'a Account, peer_id: &str) -> Vec<&'a str> {
    account
        .groups
        .values()
        .filter(|g| g.contains(peer_id))
        .map(|g| g.id.as_str())
        .collect()
}
