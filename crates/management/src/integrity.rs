//! Referential integrity checks for group references
//!
//! A group is "linked" when another resource of the account names it.
//! Deletion of a linked group is refused with the first referencing
//! category in [`LINK_PRECEDENCE`].

use meshplane_common::{Account, GroupLinkError, LinkedResource, Result};

/// Order in which referencing categories are reported
pub const LINK_PRECEDENCE: [LinkedResource; 7] = [
    LinkedResource::Route,
    LinkedResource::NameServerGroup,
    LinkedResource::Policy,
    LinkedResource::SetupKey,
    LinkedResource::User,
    LinkedResource::NetworkRouter,
    LinkedResource::DnsSettings,
];

/// Categories whose references change what peers are sent
const DISTRIBUTION_RESOURCES: [LinkedResource; 5] = [
    LinkedResource::Route,
    LinkedResource::NameServerGroup,
    LinkedResource::Policy,
    LinkedResource::NetworkRouter,
    LinkedResource::DnsSettings,
];

fn named(name: &str, id: &str) -> String {
    if name.is_empty() {
        id.to_string()
    } else {
        name.to_string()
    }
}

/// First resource of one category referencing the group, by name
pub fn linked_by(account: &Account, group_id: &str, resource: LinkedResource) -> Option<String> {
    let has = |ids: &[String]| ids.iter().any(|g| g == group_id);

    match resource {
        LinkedResource::Route => account
            .routes
            .values()
            .find(|r| r.references_group(group_id))
            .map(|r| named(&r.net_id, &r.id)),
        LinkedResource::NameServerGroup => account
            .name_server_groups
            .values()
            .find(|ns| has(&ns.groups))
            .map(|ns| named(&ns.name, &ns.id)),
        LinkedResource::Policy => account
            .policies
            .iter()
            .find(|p| p.references_group(group_id))
            .map(|p| named(&p.name, &p.id)),
        LinkedResource::SetupKey => account
            .setup_keys
            .values()
            .find(|k| has(&k.auto_groups))
            .map(|k| named(&k.name, &k.id)),
        LinkedResource::User => account
            .users
            .values()
            .find(|u| has(&u.auto_groups))
            .map(|u| u.id.clone()),
        LinkedResource::NetworkRouter => account
            .network_routers
            .values()
            .find(|r| has(&r.peer_groups))
            .map(|r| r.id.clone()),
        LinkedResource::DnsSettings => has(&account.dns_settings.disabled_management_groups)
            .then(|| "disabled management groups".to_string()),
    }
}

/// First link of the group following [`LINK_PRECEDENCE`]
pub fn find_group_link(account: &Account, group_id: &str) -> Option<GroupLinkError> {
    LINK_PRECEDENCE.iter().find_map(|&resource| {
        linked_by(account, group_id, resource).map(|name| GroupLinkError { resource, name })
    })
}

/// Refuse deletion of a referenced group
pub fn check_group_deletable(account: &Account, group_id: &str) -> Result<()> {
    match find_group_link(account, group_id) {
        Some(link) => Err(link.into()),
        None => Ok(()),
    }
}

/// Whether the group feeds into any peer's network map.
///
/// Setup keys and users only matter at enrollment time, so their
/// references do not count here.
pub fn is_distribution_linked(account: &Account, group_id: &str) -> bool {
    DISTRIBUTION_RESOURCES
        .iter()
        .any(|&resource| linked_by(account, group_id, resource).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{
        Group, NameServerGroup, NetworkRouter, Policy, PolicyRule, Route, SetupKey, User, UserRole,
    };

    fn account_with_group() -> Account {
        let mut account = Account::new("acc", "owner", "example.com");
        account.groups.insert("g".to_string(), Group::new("g", "G"));
        account
    }

    fn route(groups: Vec<String>, peer_groups: Vec<String>) -> Route {
        let mut route = Route::new("r1", "10.0.0.0/16".parse().unwrap());
        route.groups = groups;
        route.peer_groups = peer_groups;
        route
    }

    #[test]
    fn test_unlinked_group() {
        let account = account_with_group();
        assert!(find_group_link(&account, "g").is_none());
        assert!(check_group_deletable(&account, "g").is_ok());
        assert!(!is_distribution_linked(&account, "g"));
    }

    #[test]
    fn test_each_category_detected() {
        let g = || vec!["g".to_string()];

        let mut account = account_with_group();
        account.routes.insert("r1".to_string(), route(vec![], g()));
        assert_eq!(find_group_link(&account, "g").unwrap().resource, LinkedResource::Route);

        let mut account = account_with_group();
        account.name_server_groups.insert(
            "ns".to_string(),
            NameServerGroup {
                id: "ns".to_string(),
                groups: g(),
                ..Default::default()
            },
        );
        assert_eq!(
            find_group_link(&account, "g").unwrap().resource,
            LinkedResource::NameServerGroup
        );

        let mut account = account_with_group();
        account.setup_keys.insert(
            "k".to_string(),
            SetupKey {
                id: "k".to_string(),
                auto_groups: g(),
                ..Default::default()
            },
        );
        assert_eq!(find_group_link(&account, "g").unwrap().resource, LinkedResource::SetupKey);
        assert!(!is_distribution_linked(&account, "g"));

        let mut account = account_with_group();
        let mut user = User::new("u", UserRole::User);
        user.auto_groups = g();
        account.users.insert("u".to_string(), user);
        assert_eq!(find_group_link(&account, "g").unwrap().resource, LinkedResource::User);

        let mut account = account_with_group();
        account.network_routers.insert(
            "rt".to_string(),
            NetworkRouter {
                id: "rt".to_string(),
                network_id: "n".to_string(),
                peer_groups: g(),
                enabled: true,
                ..Default::default()
            },
        );
        assert_eq!(
            find_group_link(&account, "g").unwrap().resource,
            LinkedResource::NetworkRouter
        );
        assert!(is_distribution_linked(&account, "g"));

        let mut account = account_with_group();
        account.dns_settings.disabled_management_groups = g();
        assert_eq!(find_group_link(&account, "g").unwrap().resource, LinkedResource::DnsSettings);
        assert!(is_distribution_linked(&account, "g"));
    }

    #[test]
    fn test_precedence_route_before_policy_before_user() {
        let mut account = account_with_group();
        let mut user = User::new("u", UserRole::User);
        user.auto_groups = vec!["g".to_string()];
        account.users.insert("u".to_string(), user);
        account.policies.push(Policy {
            id: "p".to_string(),
            name: "p".to_string(),
            rules: vec![PolicyRule {
                destinations: vec!["g".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(find_group_link(&account, "g").unwrap().resource, LinkedResource::Policy);

        account
            .routes
            .insert("r1".to_string(), route(vec!["g".to_string()], vec![]));
        let link = find_group_link(&account, "g").unwrap();
        assert_eq!(link.resource, LinkedResource::Route);
        assert_eq!(link.name, "r1");
    }
}
