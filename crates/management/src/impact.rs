//! Decides whether a committed change needs a push to peers
//!
//! Every analysis runs against the account as it stands after the change.
//! The only outcomes are "nobody" and "every peer of the account";
//! recomputing everyone is always correct, the analysis just skips work
//! that cannot change any map.

use crate::integrity;
use meshplane_common::{Account, DnsSettings, NameServerGroup, NetworkRouter, Policy, Route};

/// Mutation handed to the analyzer
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    /// Groups were saved, deleted, or had their membership edited
    Groups(&'a [String]),
    Policy {
        old: Option<&'a Policy>,
        new: Option<&'a Policy>,
    },
    Route {
        old: Option<&'a Route>,
        new: Option<&'a Route>,
    },
    NameServerGroup {
        old: Option<&'a NameServerGroup>,
        new: Option<&'a NameServerGroup>,
    },
    NetworkRouter {
        old: Option<&'a NetworkRouter>,
        new: Option<&'a NetworkRouter>,
    },
    NetworkResource {
        network_id: &'a str,
    },
    DnsSettings {
        old: &'a DnsSettings,
        new: &'a DnsSettings,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    /// No peer's map can differ
    Unaffected,
    /// Recompute and push every connected peer
    Account,
}

impl Impact {
    pub fn is_affected(&self) -> bool {
        matches!(self, Impact::Account)
    }

    fn from_bool(affected: bool) -> Self {
        if affected {
            Impact::Account
        } else {
            Impact::Unaffected
        }
    }
}

impl std::fmt::Display for Impact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unaffected => write!(f, "unaffected"),
            Self::Account => write!(f, "account"),
        }
    }
}

fn group_has_peers(account: &Account, group_id: &str) -> bool {
    match account.groups.get(group_id) {
        Some(_) if account.is_group_all(group_id) => !account.peers.is_empty(),
        Some(group) => group.peers.iter().any(|p| account.peers.contains_key(p)),
        None => false,
    }
}

fn any_has_peers<'a>(account: &Account, mut ids: impl Iterator<Item = &'a String>) -> bool {
    ids.any(|g| group_has_peers(account, g))
}

fn known_peer(account: &Account, peer: Option<&String>) -> bool {
    peer.map_or(false, |p| account.peers.contains_key(p))
}

fn policy_affects(account: &Account, policy: &Policy) -> bool {
    policy.enabled
        && policy.rules.iter().filter(|r| r.enabled).any(|r| {
            any_has_peers(account, r.sources.iter()) || any_has_peers(account, r.destinations.iter())
        })
}

fn route_affects(account: &Account, route: &Route) -> bool {
    route.enabled
        && (known_peer(account, route.peer.as_ref())
            || any_has_peers(account, route.peer_groups.iter().chain(route.groups.iter())))
}

fn name_server_group_affects(account: &Account, ns: &NameServerGroup) -> bool {
    ns.enabled && any_has_peers(account, ns.groups.iter())
}

fn router_affects(account: &Account, router: &NetworkRouter) -> bool {
    router.enabled
        && (known_peer(account, router.peer.as_ref())
            || any_has_peers(account, router.peer_groups.iter()))
}

fn either<T>(old: Option<&T>, new: Option<&T>, affects: impl Fn(&T) -> bool) -> bool {
    old.map_or(false, &affects) || new.map_or(false, &affects)
}

/// Classify a committed change
pub fn analyze(account: &Account, change: Change<'_>) -> Impact {
    let affected = match change {
        Change::Groups(ids) => ids
            .iter()
            .any(|g| integrity::is_distribution_linked(account, g)),
        Change::Policy { old, new } => either(old, new, |p| policy_affects(account, p)),
        Change::Route { old, new } => either(old, new, |r| route_affects(account, r)),
        Change::NameServerGroup { old, new } => {
            either(old, new, |ns| name_server_group_affects(account, ns))
        }
        Change::NetworkRouter { old, new } => either(old, new, |r| router_affects(account, r)),
        Change::NetworkResource { network_id } => account
            .network_routers
            .values()
            .filter(|r| r.network_id == network_id)
            .any(|r| router_affects(account, r)),
        Change::DnsSettings { old, new } => {
            let before = &old.disabled_management_groups;
            let after = &new.disabled_management_groups;
            let added = after.iter().filter(|g| !before.contains(g));
            let removed = before.iter().filter(|g| !after.contains(g));
            any_has_peers(account, added.chain(removed))
        }
    };
    Impact::from_bool(affected)
}
