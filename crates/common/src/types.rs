//! Core types for Meshplane
//!
//! An [`Account`] is the root aggregate. Child entities reference groups by
//! ID only; groups own the peer membership relation.

use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Name of the group that implicitly holds every peer
pub const GROUP_ALL_NAME: &str = "All";

/// Address range peers are allocated from (100.64.0.0/10)
pub fn default_peer_range() -> Ipv4Network {
    let base = Ipv4Addr::new(100, 64, 0, 0);
    Ipv4Network::new(base, 10).unwrap_or_else(|_| Ipv4Network::from(base))
}

/// Default DNS port for name servers
pub const DEFAULT_DNS_PORT: u16 = 53;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Account
// ============================================================================

/// Peer address space and change counter of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountNetwork {
    pub net: Ipv4Network,
    /// Incremented on every committed mutation
    pub serial: u64,
}

impl Default for AccountNetwork {
    fn default() -> Self {
        Self {
            net: default_peer_range(),
            serial: 0,
        }
    }
}

/// A tenant's complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub created_by: String,
    pub domain: String,
    pub created_at: i64,
    #[serde(default)]
    pub network: AccountNetwork,
    /// ID of the group that implicitly holds every peer
    #[serde(default)]
    pub all_group_id: String,
    #[serde(default)]
    pub peers: BTreeMap<String, Peer>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    /// Evaluated in order
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub routes: BTreeMap<String, Route>,
    #[serde(default)]
    pub name_server_groups: BTreeMap<String, NameServerGroup>,
    #[serde(default)]
    pub setup_keys: BTreeMap<String, SetupKey>,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
    #[serde(default)]
    pub network_resources: BTreeMap<String, NetworkResource>,
    #[serde(default)]
    pub network_routers: BTreeMap<String, NetworkRouter>,
    #[serde(default)]
    pub dns_settings: DnsSettings,
}

impl Account {
    /// Create an account with the "All" group, an owner and the default
    /// allow-all policy
    pub fn new(id: impl Into<String>, created_by: impl Into<String>, domain: impl Into<String>) -> Self {
        let id = id.into();
        let created_by = created_by.into();

        let all = Group {
            id: new_id(),
            account_id: id.clone(),
            name: GROUP_ALL_NAME.to_string(),
            issued: GroupIssued::Api,
            peers: Vec::new(),
        };

        let default_policy = Policy {
            id: new_id(),
            name: "Default".to_string(),
            description: "This is a default rule that allows connections between all the resources".to_string(),
            enabled: true,
            rules: vec![PolicyRule {
                id: new_id(),
                name: "Default".to_string(),
                bidirectional: true,
                sources: vec![all.id.clone()],
                destinations: vec![all.id.clone()],
                ..Default::default()
            }],
        };

        let mut account = Self {
            id,
            created_by: created_by.clone(),
            domain: domain.into(),
            created_at: chrono::Utc::now().timestamp(),
            network: AccountNetwork::default(),
            all_group_id: all.id.clone(),
            peers: BTreeMap::new(),
            groups: BTreeMap::new(),
            policies: vec![default_policy],
            routes: BTreeMap::new(),
            name_server_groups: BTreeMap::new(),
            setup_keys: BTreeMap::new(),
            users: BTreeMap::new(),
            networks: BTreeMap::new(),
            network_resources: BTreeMap::new(),
            network_routers: BTreeMap::new(),
            dns_settings: DnsSettings::default(),
        };
        account.groups.insert(all.id.clone(), all);
        account.users.insert(created_by.clone(), User::new(created_by, UserRole::Owner));
        account
    }

    /// The group that implicitly contains every peer
    pub fn group_all(&self) -> Option<&Group> {
        self.groups.get(&self.all_group_id)
    }

    pub fn is_group_all(&self, group_id: &str) -> bool {
        !group_id.is_empty() && group_id == self.all_group_id
    }

    pub fn get_group(&self, group_id: &str) -> Result<&Group> {
        self.groups
            .get(group_id)
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    pub fn get_peer(&self, peer_id: &str) -> Result<&Peer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| Error::not_found("peer", peer_id))
    }

    pub fn get_user(&self, user_id: &str) -> Result<&User> {
        self.users
            .get(user_id)
            .ok_or_else(|| Error::not_found("user", user_id))
    }

    pub fn get_policy(&self, policy_id: &str) -> Result<&Policy> {
        self.policies
            .iter()
            .find(|p| p.id == policy_id)
            .ok_or_else(|| Error::not_found("policy", policy_id))
    }

    /// Fail with NotFound for the first group ID absent from the account
    pub fn ensure_groups_exist<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for id in ids {
            if !self.groups.contains_key(id) {
                return Err(Error::not_found("group", id.as_str()));
            }
        }
        Ok(())
    }

    /// Record a committed mutation
    pub fn bump_serial(&mut self) -> u64 {
        self.network.serial += 1;
        self.network.serial
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Connection status of a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub last_seen: i64,
}

/// An enrolled device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// WireGuard public key
    pub key: String,
    pub name: String,
    pub dns_label: String,
    pub ip: Ipv4Addr,
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: PeerStatus,
    pub created_at: i64,
}

impl Peer {
    pub fn new(id: impl Into<String>, key: impl Into<String>, ip: Ipv4Addr) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            dns_label: id.clone(),
            id,
            key: key.into(),
            ip,
            user_id: None,
            status: PeerStatus::default(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Groups
// ============================================================================

/// Source that created a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupIssued {
    Api,
    Jwt,
    Integration,
}

impl Default for GroupIssued {
    fn default() -> Self {
        Self::Api
    }
}

impl std::fmt::Display for GroupIssued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Jwt => write!(f, "jwt"),
            Self::Integration => write!(f, "integration"),
        }
    }
}

/// A named set of peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub issued: GroupIssued,
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_issued(mut self, issued: GroupIssued) -> Self {
        self.issued = issued;
        self
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p == peer_id)
    }

    /// Returns false when the peer was already a member
    pub fn add_peer(&mut self, peer_id: &str) -> bool {
        if self.contains(peer_id) {
            return false;
        }
        self.peers.push(peer_id.to_string());
        true
    }

    /// Returns false when the peer was not a member
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer_id);
        self.peers.len() != before
    }
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    Drop,
}

impl Default for PolicyAction {
    fn default() -> Self {
        Self::Accept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::All
    }
}

/// One access-control statement between group sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub action: PolicyAction,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Default for PolicyRule {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: true,
            action: PolicyAction::Accept,
            protocol: Protocol::All,
            bidirectional: false,
            sources: Vec::new(),
            destinations: Vec::new(),
            ports: Vec::new(),
        }
    }
}

/// An ordered set of rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            enabled: true,
            rules: Vec::new(),
        }
    }
}

impl Policy {
    /// Every group ID named by any rule, sources first
    pub fn rule_groups(&self) -> impl Iterator<Item = &String> {
        self.rules
            .iter()
            .flat_map(|r| r.sources.iter().chain(r.destinations.iter()))
    }

    pub fn references_group(&self, group_id: &str) -> bool {
        self.rule_groups().any(|g| g == group_id)
    }
}

// ============================================================================
// Routes
// ============================================================================

/// A network prefix advertised by peers and distributed to groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default)]
    pub net_id: String,
    pub network: IpNetwork,
    #[serde(default)]
    pub description: String,
    /// Single advertising peer, exclusive with `peer_groups`
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub peer_groups: Vec<String>,
    /// Groups receiving the route
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
    pub enabled: bool,
}

impl Route {
    pub fn new(id: impl Into<String>, network: IpNetwork) -> Self {
        let id = id.into();
        Self {
            net_id: id.clone(),
            id,
            network,
            description: String::new(),
            peer: None,
            peer_groups: Vec::new(),
            groups: Vec::new(),
            metric: 9999,
            masquerade: false,
            enabled: true,
        }
    }

    pub fn references_group(&self, group_id: &str) -> bool {
        self.groups.iter().chain(self.peer_groups.iter()).any(|g| g == group_id)
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameServerType {
    Udp,
}

impl Default for NameServerType {
    fn default() -> Self {
        Self::Udp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub ip: IpAddr,
    #[serde(default)]
    pub ns_type: NameServerType,
    pub port: u16,
}

impl NameServer {
    pub fn udp(ip: IpAddr) -> Self {
        Self {
            ip,
            ns_type: NameServerType::Udp,
            port: DEFAULT_DNS_PORT,
        }
    }
}

/// Resolver configuration distributed to groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServerGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub name_servers: Vec<NameServer>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub search_domains_enabled: bool,
    pub enabled: bool,
}

/// Account-wide DNS settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Peers in these groups do not receive managed DNS
    #[serde(default)]
    pub disabled_management_groups: Vec<String>,
}

// ============================================================================
// Networks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Internal address exposed through a network's routers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResource {
    pub id: String,
    pub network_id: String,
    pub name: String,
    pub address: IpNetwork,
    pub enabled: bool,
}

/// Peers routing traffic into a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRouter {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub peer_groups: Vec<String>,
    #[serde(default)]
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
    pub enabled: bool,
}

// ============================================================================
// Setup keys & users
// ============================================================================

/// Enrollment key. Peers joining with it land in `auto_groups`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupKey {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub auto_groups: Vec<String>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub used_times: u32,
    /// 0 means unlimited
    #[serde(default)]
    pub usage_limit: u32,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl SetupKey {
    pub fn is_valid(&self, now: i64) -> bool {
        if self.revoked {
            return false;
        }
        if self.expires_at.map_or(false, |exp| exp <= now) {
            return false;
        }
        self.usage_limit == 0 || self.used_times < self.usage_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    User,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

impl UserRole {
    pub fn has_admin_power(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub is_service_user: bool,
    #[serde(default)]
    pub blocked: bool,
    /// Groups assigned to peers this user enrolls
    #[serde(default)]
    pub auto_groups: Vec<String>,
}

impl User {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            role,
            ..Default::default()
        }
    }

    pub fn service(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            is_service_user: true,
            ..Self::new(id, role)
        }
    }

    pub fn is_service_admin(&self) -> bool {
        self.is_service_user && self.role.has_admin_power()
    }
}
