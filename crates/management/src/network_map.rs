//! Per-peer network map computation
//!
//! A [`NetworkMap`] is a pure function of one account snapshot. The builder
//! shares a single [`PolicyEngine`] across every peer it computes for.

use crate::policy::{FirewallRule, PolicyEngine};
use ipnetwork::IpNetwork;
use meshplane_common::{Account, NameServerGroup, Result, Route};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Whether the peer serves a prefix or sends traffic to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteDirection {
    Advertise,
    Consume,
}

impl std::fmt::Display for RouteDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advertise => write!(f, "advertise"),
            Self::Consume => write!(f, "consume"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteGrant {
    pub route_id: String,
    pub network: IpNetwork,
    pub metric: u32,
    pub masquerade: bool,
    pub direction: RouteDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub resource_id: String,
    pub network_id: String,
    pub address: IpNetwork,
    pub direction: RouteDirection,
}

/// Everything one peer is allowed to see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    pub peer_id: String,
    /// Account serial the map was computed at
    pub serial: u64,
    pub accessible_peers: BTreeSet<String>,
    pub firewall_rules: BTreeSet<FirewallRule>,
    pub routes: Vec<RouteGrant>,
    pub resources: Vec<ResourceGrant>,
    /// Peers advertising the routes and resources this peer consumes
    pub route_peers: BTreeSet<String>,
    pub name_server_groups: Vec<NameServerGroup>,
    pub dns_management_enabled: bool,
}

impl NetworkMap {
    pub fn can_reach(&self, peer_id: &str) -> bool {
        self.accessible_peers.contains(peer_id)
    }

    pub fn has_route(&self, route_id: &str, direction: RouteDirection) -> bool {
        self.routes
            .iter()
            .any(|r| r.route_id == route_id && r.direction == direction)
    }
}

/// Computes network maps for any number of peers of one snapshot
pub struct NetworkMapBuilder<'a> {
    engine: PolicyEngine<'a>,
    /// Network ID to peers of its enabled routers
    routing_peers: BTreeMap<&'a str, BTreeSet<&'a str>>,
}

impl<'a> NetworkMapBuilder<'a> {
    pub fn new(account: &'a Account) -> Self {
        let engine = PolicyEngine::new(account);

        let mut routing_peers: BTreeMap<&'a str, BTreeSet<&'a str>> = BTreeMap::new();
        for router in account.network_routers.values().filter(|r| r.enabled) {
            let entry = routing_peers.entry(router.network_id.as_str()).or_default();
            if let Some(peer) = router.peer.as_deref() {
                if account.peers.contains_key(peer) {
                    entry.insert(peer);
                }
            }
            entry.extend(engine.index().members_of_any(&router.peer_groups));
        }

        Self {
            engine,
            routing_peers,
        }
    }

    pub fn engine(&self) -> &PolicyEngine<'a> {
        &self.engine
    }

    fn route_advertisers(&self, route: &'a Route) -> BTreeSet<&'a str> {
        let account = self.engine.account();
        let mut peers: BTreeSet<&'a str> = self
            .engine
            .index()
            .members_of_any(&route.peer_groups)
            .into_iter()
            .collect();
        if let Some(peer) = route.peer.as_deref() {
            if account.peers.contains_key(peer) {
                peers.insert(peer);
            }
        }
        peers
    }

    /// Compute the map of one peer
    pub fn build(&self, peer_id: &str) -> Result<NetworkMap> {
        let account = self.engine.account();
        let peer = account.get_peer(peer_id)?;
        let index = self.engine.index();

        let accessible_peers = self.engine.accessible_peers(&peer.id);
        let firewall_rules = self.engine.firewall_rules(&peer.id);

        let mut routes = Vec::new();
        let mut route_peers = BTreeSet::new();
        for route in account.routes.values().filter(|r| r.enabled) {
            let advertisers = self.route_advertisers(route);
            if advertisers.contains(peer_id) {
                routes.push(route_grant(route, RouteDirection::Advertise));
            }
            if index.peer_in_any(peer_id, &route.groups) {
                routes.push(route_grant(route, RouteDirection::Consume));
                route_peers.extend(
                    advertisers
                        .iter()
                        .filter(|p| **p != peer_id)
                        .map(|p| p.to_string()),
                );
            }
        }

        let mut resources = Vec::new();
        for resource in account.network_resources.values().filter(|r| r.enabled) {
            let Some(routers) = self.routing_peers.get(resource.network_id.as_str()) else {
                continue;
            };
            let direction = if routers.contains(peer_id) {
                RouteDirection::Advertise
            } else if routers.iter().any(|r| accessible_peers.contains(*r)) {
                route_peers.extend(
                    routers
                        .iter()
                        .filter(|r| accessible_peers.contains(**r))
                        .map(|r| r.to_string()),
                );
                RouteDirection::Consume
            } else {
                continue;
            };
            resources.push(ResourceGrant {
                resource_id: resource.id.clone(),
                network_id: resource.network_id.clone(),
                address: resource.address,
                direction,
            });
        }

        let name_server_groups = account
            .name_server_groups
            .values()
            .filter(|ns| ns.enabled && index.peer_in_any(peer_id, &ns.groups))
            .cloned()
            .collect();

        let dns_management_enabled =
            !index.peer_in_any(peer_id, &account.dns_settings.disabled_management_groups);

        Ok(NetworkMap {
            peer_id: peer.id.clone(),
            serial: account.network.serial,
            accessible_peers,
            firewall_rules,
            routes,
            resources,
            route_peers,
            name_server_groups,
            dns_management_enabled,
        })
    }
}

fn route_grant(route: &Route, direction: RouteDirection) -> RouteGrant {
    RouteGrant {
        route_id: route.id.clone(),
        network: route.network,
        metric: route.metric,
        masquerade: route.masquerade,
        direction,
    }
}
