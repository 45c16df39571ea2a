//! Input checks for resources that reference groups and peers
//!
//! All checks run against the snapshot the resource will be written into.

use meshplane_common::{
    Account, DnsSettings, Error, NameServerGroup, NetworkResource, NetworkRouter, Policy, Result,
    Route,
};

const MAX_NAME_SERVERS: usize = 3;

pub fn validate_policy(account: &Account, policy: &Policy) -> Result<()> {
    if policy.name.trim().is_empty() {
        return Err(Error::validation("policy name shouldn't be empty"));
    }
    account.ensure_groups_exist(policy.rule_groups())
}

pub fn validate_route(account: &Account, route: &Route) -> Result<()> {
    if route.groups.is_empty() {
        return Err(Error::validation("route distribution groups shouldn't be empty"));
    }
    match (&route.peer, route.peer_groups.is_empty()) {
        (Some(_), false) => {
            return Err(Error::validation("peer and peer groups can't be set at the same time"));
        }
        (None, true) => {
            return Err(Error::validation("either peer or peer groups should be set"));
        }
        (Some(peer), true) => {
            account.get_peer(peer)?;
        }
        (None, false) => {}
    }
    account.ensure_groups_exist(route.peer_groups.iter().chain(route.groups.iter()))
}

pub fn validate_name_server_group(account: &Account, ns: &NameServerGroup) -> Result<()> {
    if ns.name.trim().is_empty() {
        return Err(Error::validation("name server group name shouldn't be empty"));
    }
    if ns.name_servers.is_empty() || ns.name_servers.len() > MAX_NAME_SERVERS {
        return Err(Error::validation(format!(
            "name server group must have between 1 and {} name servers",
            MAX_NAME_SERVERS
        )));
    }
    if ns.groups.is_empty() {
        return Err(Error::validation("name server group distribution groups shouldn't be empty"));
    }
    if !ns.primary && ns.domains.is_empty() {
        return Err(Error::validation(
            "name server group should be primary or have at least one domain",
        ));
    }
    if ns.domains.iter().any(|d| d.trim().is_empty()) {
        return Err(Error::validation("name server group domain shouldn't be empty"));
    }
    account.ensure_groups_exist(ns.groups.iter())
}

pub fn validate_dns_settings(account: &Account, settings: &DnsSettings) -> Result<()> {
    account.ensure_groups_exist(settings.disabled_management_groups.iter())
}

pub fn validate_network_resource(account: &Account, resource: &NetworkResource) -> Result<()> {
    if !account.networks.contains_key(&resource.network_id) {
        return Err(Error::not_found("network", resource.network_id.as_str()));
    }
    if resource.name.trim().is_empty() {
        return Err(Error::validation("network resource name shouldn't be empty"));
    }
    Ok(())
}

pub fn validate_network_router(account: &Account, router: &NetworkRouter) -> Result<()> {
    if !account.networks.contains_key(&router.network_id) {
        return Err(Error::not_found("network", router.network_id.as_str()));
    }
    match (&router.peer, router.peer_groups.is_empty()) {
        (Some(_), false) => {
            return Err(Error::validation("peer and peer groups can't be set at the same time"));
        }
        (None, true) => {
            return Err(Error::validation("either peer or peer groups should be set"));
        }
        (Some(peer), true) => {
            account.get_peer(peer)?;
        }
        (None, false) => {}
    }
    account.ensure_groups_exist(router.peer_groups.iter())
}
