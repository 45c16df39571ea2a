//! Policy evaluation
//!
//! Group membership is indexed once per pass and every enabled rule is
//! resolved to concrete peer sets up front. Accept rules grant reachability;
//! Drop rules only surface as firewall entries and never revoke an Accept.

use meshplane_common::{Account, PolicyAction, PolicyRule, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

// ============================================================================
// Group index
// ============================================================================

/// Group to peer and peer to group lookups for one account snapshot
pub struct GroupIndex<'a> {
    members: HashMap<&'a str, HashSet<&'a str>>,
    groups_of: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> GroupIndex<'a> {
    /// Index every group. The "All" group resolves to every peer of the
    /// account; other groups keep only members that exist.
    pub fn new(account: &'a Account) -> Self {
        let mut members = HashMap::with_capacity(account.groups.len());
        let mut groups_of: HashMap<&'a str, Vec<&'a str>> =
            account.peers.keys().map(|p| (p.as_str(), Vec::new())).collect();

        for group in account.groups.values() {
            let peers: HashSet<&'a str> = if account.is_group_all(&group.id) {
                account.peers.keys().map(String::as_str).collect()
            } else {
                group
                    .peers
                    .iter()
                    .map(String::as_str)
                    .filter(|p| account.peers.contains_key(*p))
                    .collect()
            };
            for peer in &peers {
                if let Some(gs) = groups_of.get_mut(peer) {
                    gs.push(group.id.as_str());
                }
            }
            members.insert(group.id.as_str(), peers);
        }

        Self { members, groups_of }
    }

    pub fn members(&self, group_id: &str) -> Option<&HashSet<&'a str>> {
        self.members.get(group_id)
    }

    pub fn has_peers(&self, group_id: &str) -> bool {
        self.members.get(group_id).map_or(false, |m| !m.is_empty())
    }

    /// Union of the members of every listed group
    pub fn members_of_any(&self, group_ids: &[String]) -> HashSet<&'a str> {
        group_ids
            .iter()
            .filter_map(|g| self.members.get(g.as_str()))
            .flat_map(|m| m.iter().copied())
            .collect()
    }

    pub fn groups_of(&self, peer_id: &str) -> &[&'a str] {
        self.groups_of.get(peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn peer_in_any(&self, peer_id: &str, group_ids: &[String]) -> bool {
        group_ids
            .iter()
            .any(|g| self.members.get(g.as_str()).map_or(false, |m| m.contains(peer_id)))
    }
}

// ============================================================================
// Firewall output
// ============================================================================

/// Direction of traffic relative to the peer the rule is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    In,
    Out,
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Packet filter entry for the remote side of one rule edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirewallRule {
    pub peer_id: String,
    pub peer_ip: Ipv4Addr,
    pub direction: TrafficDirection,
    pub action: PolicyAction,
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

// ============================================================================
// Engine
// ============================================================================

/// A rule with its groups expanded to peer IDs
pub struct ResolvedRule<'a> {
    pub policy_id: &'a str,
    pub rule: &'a PolicyRule,
    pub sources: HashSet<&'a str>,
    pub destinations: HashSet<&'a str>,
}

/// Reachability evaluator over one account snapshot
pub struct PolicyEngine<'a> {
    account: &'a Account,
    index: GroupIndex<'a>,
    rules: Vec<ResolvedRule<'a>>,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(account: &'a Account) -> Self {
        let index = GroupIndex::new(account);

        let rules = account
            .policies
            .iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.rules.iter().filter(|r| r.enabled).map(move |r| (p, r)))
            .map(|(policy, rule)| ResolvedRule {
                policy_id: policy.id.as_str(),
                rule,
                sources: index.members_of_any(&rule.sources),
                destinations: index.members_of_any(&rule.destinations),
            })
            .collect();

        Self {
            account,
            index,
            rules,
        }
    }

    pub fn account(&self) -> &'a Account {
        self.account
    }

    pub fn index(&self) -> &GroupIndex<'a> {
        &self.index
    }

    pub fn rules(&self) -> &[ResolvedRule<'a>] {
        &self.rules
    }

    /// Peers the given peer may connect to, itself included.
    ///
    /// Unknown peers reach nothing.
    pub fn accessible_peers(&self, peer_id: &str) -> BTreeSet<String> {
        let mut accessible = BTreeSet::new();
        if !self.account.peers.contains_key(peer_id) {
            return accessible;
        }
        accessible.insert(peer_id.to_string());

        for resolved in &self.rules {
            if resolved.rule.action != PolicyAction::Accept {
                continue;
            }
            if resolved.sources.contains(peer_id) {
                accessible.extend(resolved.destinations.iter().map(|p| p.to_string()));
            }
            if resolved.rule.bidirectional && resolved.destinations.contains(peer_id) {
                accessible.extend(resolved.sources.iter().map(|p| p.to_string()));
            }
        }
        accessible
    }

    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        if !self.account.peers.contains_key(from) || !self.account.peers.contains_key(to) {
            return false;
        }
        if from == to {
            return true;
        }
        self.rules.iter().any(|r| {
            r.rule.action == PolicyAction::Accept
                && ((r.sources.contains(from) && r.destinations.contains(to))
                    || (r.rule.bidirectional && r.destinations.contains(from) && r.sources.contains(to)))
        })
    }

    /// Firewall entries for every rule edge that touches the peer
    pub fn firewall_rules(&self, peer_id: &str) -> BTreeSet<FirewallRule> {
        let mut out = BTreeSet::new();
        if !self.account.peers.contains_key(peer_id) {
            return out;
        }

        for resolved in &self.rules {
            let rule = resolved.rule;
            let in_sources = resolved.sources.contains(peer_id);
            let in_destinations = resolved.destinations.contains(peer_id);

            if in_sources {
                self.push_edges(&mut out, peer_id, &resolved.destinations, TrafficDirection::Out, rule);
            }
            if in_destinations {
                self.push_edges(&mut out, peer_id, &resolved.sources, TrafficDirection::In, rule);
            }
            if rule.bidirectional {
                if in_destinations {
                    self.push_edges(&mut out, peer_id, &resolved.sources, TrafficDirection::Out, rule);
                }
                if in_sources {
                    self.push_edges(&mut out, peer_id, &resolved.destinations, TrafficDirection::In, rule);
                }
            }
        }
        out
    }

    fn push_edges(
        &self,
        out: &mut BTreeSet<FirewallRule>,
        peer_id: &str,
        remotes: &HashSet<&'a str>,
        direction: TrafficDirection,
        rule: &PolicyRule,
    ) {
        for remote in remotes.iter().filter(|r| **r != peer_id) {
            if let Some(peer) = self.account.peers.get(*remote) {
                out.insert(FirewallRule {
                    peer_id: peer.id.clone(),
                    peer_ip: peer.ip,
                    direction,
                    action: rule.action,
                    protocol: rule.protocol,
                    ports: rule.ports.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{Group, Peer, Policy};

    fn account(peers: &[&str]) -> Account {
        let mut account = Account::new("acc", "owner", "example.com");
        account.policies.clear();
        for (i, id) in peers.iter().enumerate() {
            account.peers.insert(
                id.to_string(),
                Peer::new(*id, format!("key-{}", id), Ipv4Addr::new(100, 64, 0, i as u8 + 1)),
            );
        }
        account
    }

    fn policy(rule: PolicyRule) -> Policy {
        Policy {
            id: "pol".to_string(),
            name: "pol".to_string(),
            rules: vec![rule],
            ..Default::default()
        }
    }

    fn rule(sources: &[&str], destinations: &[&str]) -> PolicyRule {
        PolicyRule {
            id: "rule".to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            destinations: destinations.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_peer_always_reaches_itself() {
        let account = account(&["p1", "p2"]);
        let engine = PolicyEngine::new(&account);
        assert_eq!(engine.accessible_peers("p1").into_iter().collect::<Vec<_>>(), vec!["p1"]);
        assert!(engine.can_reach("p2", "p2"));
        assert!(!engine.can_reach("p1", "p2"));
    }

    #[test]
    fn test_unknown_peer_reaches_nothing() {
        let account = account(&["p1"]);
        let engine = PolicyEngine::new(&account);
        assert!(engine.accessible_peers("ghost").is_empty());
        assert!(engine.firewall_rules("ghost").is_empty());
    }

    #[test]
    fn test_bidirectional_self_group_is_mutual() {
        let mut account = account(&["p1", "p2", "p3", "p4"]);
        account
            .groups
            .insert("a".to_string(), Group::new("a", "A").with_peers(["p1", "p2", "p3"]));
        account.policies.push(policy(PolicyRule {
            bidirectional: true,
            ..rule(&["a"], &["a"])
        }));

        let engine = PolicyEngine::new(&account);
        for p in ["p1", "p2", "p3"] {
            let accessible = engine.accessible_peers(p);
            assert_eq!(accessible.len(), 3, "{} sees {:?}", p, accessible);
            assert!(!accessible.contains("p4"));
        }
        assert_eq!(engine.accessible_peers("p4").len(), 1);
    }

    #[test]
    fn test_one_way_rule() {
        let mut account = account(&["p1", "p2"]);
        account.groups.insert("src".to_string(), Group::new("src", "S").with_peers(["p1"]));
        account.groups.insert("dst".to_string(), Group::new("dst", "D").with_peers(["p2"]));
        account.policies.push(policy(rule(&["src"], &["dst"])));

        let engine = PolicyEngine::new(&account);
        assert!(engine.can_reach("p1", "p2"));
        assert!(!engine.can_reach("p2", "p1"));
        assert!(engine.accessible_peers("p1").contains("p2"));
        assert!(!engine.accessible_peers("p2").contains("p1"));

        let fw = engine.firewall_rules("p2");
        assert_eq!(fw.len(), 1);
        let entry = fw.iter().next().unwrap();
        assert_eq!(entry.peer_id, "p1");
        assert_eq!(entry.direction, TrafficDirection::In);
    }

    #[test]
    fn test_drop_never_revokes_accept() {
        let mut account = account(&["p1", "p2"]);
        let all = account.group_all().unwrap().id.clone();
        account.policies.push(policy(PolicyRule {
            bidirectional: true,
            ..rule(&[all.as_str()], &[all.as_str()])
        }));
        let mut deny = policy(PolicyRule {
            action: PolicyAction::Drop,
            ..rule(&[all.as_str()], &[all.as_str()])
        });
        deny.id = "deny".to_string();
        account.policies.push(deny);

        let engine = PolicyEngine::new(&account);
        assert!(engine.can_reach("p1", "p2"));
        assert!(engine
            .firewall_rules("p1")
            .iter()
            .any(|r| r.action == PolicyAction::Drop));
    }

    #[test]
    fn test_drop_alone_grants_nothing() {
        let mut account = account(&["p1", "p2"]);
        let all = account.group_all().unwrap().id.clone();
        account.policies.push(policy(PolicyRule {
            action: PolicyAction::Drop,
            bidirectional: true,
            ..rule(&[all.as_str()], &[all.as_str()])
        }));
        let engine = PolicyEngine::new(&account);
        assert_eq!(engine.accessible_peers("p1").len(), 1);
    }

    #[test]
    fn test_disabled_rule_and_policy_contribute_nothing() {
        let mut account = account(&["p1", "p2"]);
        let all = account.group_all().unwrap().id.clone();

        account.policies.push(policy(PolicyRule {
            enabled: false,
            ..rule(&[all.as_str()], &[all.as_str()])
        }));
        let mut disabled = policy(rule(&[all.as_str()], &[all.as_str()]));
        disabled.enabled = false;
        account.policies.push(disabled);

        let engine = PolicyEngine::new(&account);
        assert!(engine.rules().is_empty());
        assert!(!engine.can_reach("p1", "p2"));
    }

    #[test]
    fn test_index_ignores_unknown_members() {
        let mut account = account(&["p1"]);
        account
            .groups
            .insert("g".to_string(), Group::new("g", "G").with_peers(["p1", "gone"]));
        let index = GroupIndex::new(&account);
        assert_eq!(index.members("g").unwrap().len(), 1);
        assert!(index.groups_of("p1").contains(&"g"));
        assert!(index.groups_of("gone").is_empty());

        let all = account.group_all().unwrap().id.clone();
        assert!(index.has_peers(&all));
        assert!(index.peer_in_any("p1", &[all]));
    }
}
