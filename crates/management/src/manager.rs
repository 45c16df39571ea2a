//! Account manager
//!
//! Every mutating call runs the same pipeline under the account's exclusive
//! lock: authorize, load a snapshot, validate and apply, bump the serial,
//! persist, analyze impact, then recompute and push network maps. Pushing
//! while still holding the lock keeps per-peer deliveries in commit order.

use crate::groups;
use crate::impact::{self, Change, Impact};
use crate::locks::AccountLocks;
use crate::network_map::{NetworkMap, NetworkMapBuilder};
use crate::peers::{self, PeerEnrollment};
use crate::policy::PolicyEngine;
use crate::store::Store;
use crate::update_channel::{PeersUpdateManager, UpdateMessage};
use crate::validation;
use meshplane_common::{
    new_id, Account, BatchError, DnsSettings, Error, Group, NameServerGroup, Network,
    NetworkResource, NetworkRouter, Peer, Policy, Result, Route, User,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADMIN_REQUIRED: &str = "only users with admin power are allowed to perform this operation";

/// What a mutation did to the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Nothing to persist
    Unchanged,
    Changed(Impact),
}

/// Receiving end of a peer session plus the state it starts from
pub struct PeerSession {
    pub updates: mpsc::Receiver<UpdateMessage>,
    pub network_map: NetworkMap,
}

/// Orchestrates account mutations and peer update distribution
pub struct AccountManager {
    store: Arc<dyn Store>,
    updates: Arc<PeersUpdateManager>,
    locks: AccountLocks,
}

fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn acting_user(account: &Account, user_id: &str) -> Result<User> {
    let user = account.users.get(user_id).ok_or_else(|| {
        Error::permission_denied(format!("user {} is not part of account {}", user_id, account.id))
    })?;
    if user.blocked {
        return Err(Error::permission_denied(format!("user {} is blocked", user_id)));
    }
    Ok(user.clone())
}

fn authorize_admin(account: &Account, user_id: &str) -> Result<User> {
    let user = acting_user(account, user_id)?;
    if !user.role.has_admin_power() {
        return Err(Error::permission_denied(ADMIN_REQUIRED));
    }
    Ok(user)
}

fn changed(account: &Account, change: Change<'_>) -> Applied {
    Applied::Changed(impact::analyze(account, change))
}

fn assign_id(id: &mut String) {
    if id.is_empty() {
        *id = new_id();
    }
}

impl AccountManager {
    pub fn new(store: Arc<dyn Store>, updates: Arc<PeersUpdateManager>) -> Self {
        Self {
            store,
            updates,
            locks: AccountLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn updates(&self) -> &Arc<PeersUpdateManager> {
        &self.updates
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    async fn lock_write(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<()>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            guard = self.locks.write(account_id) => Ok(guard),
        }
    }

    /// Consistent read-only snapshot of an account
    async fn snapshot(&self, ctx: &CancellationToken, account_id: &str) -> Result<Account> {
        let _guard = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            guard = self.locks.read(account_id) => guard,
        };
        self.store.load_account(account_id).await
    }

    /// Run one mutation through the full pipeline
    async fn mutate<T, F>(&self, ctx: &CancellationToken, account_id: &str, op: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Account) -> Result<(T, Applied)> + Send,
        T: Send,
    {
        let _guard = self.lock_write(ctx, account_id).await?;
        ensure_active(ctx)?;

        let mut account = self.store.load_account(account_id).await?;
        let (value, applied) = apply(&mut account)?;

        let impact = match applied {
            Applied::Unchanged => {
                debug!("{} on account {} changed nothing", op, account_id);
                return Ok(value);
            }
            Applied::Changed(impact) => impact,
        };

        ensure_active(ctx)?;
        let serial = account.bump_serial();
        self.store.save_account(&account).await?;
        info!("{} committed on account {} at serial {} ({})", op, account_id, serial, impact);

        if impact.is_affected() {
            match self.update_account_peers(ctx, &account).await {
                Ok(sent) => debug!("Pushed {} update(s) after {}", sent, op),
                Err(e) => warn!("Distribution after {} on account {} stopped: {}", op, account_id, e),
            }
        }

        Ok(value)
    }

    /// Recompute the map of every peer holding a channel and push it.
    ///
    /// Returns the number of updates queued. Checks for cancellation before
    /// each peer.
    pub async fn update_account_peers(&self, ctx: &CancellationToken, account: &Account) -> Result<usize> {
        let builder = NetworkMapBuilder::new(account);
        let mut sent = 0;

        for peer_id in account.peers.keys() {
            ensure_active(ctx)?;
            if !self.updates.has_channel(peer_id) {
                continue;
            }
            let network_map = builder.build(peer_id)?;
            if self
                .updates
                .send_update(peer_id, UpdateMessage { network_map })
                .is_sent()
            {
                sent += 1;
            }
        }
        Ok(sent)
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Create an account with its "All" group, owner and default policy
    pub async fn create_account(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        owner_id: &str,
        domain: &str,
    ) -> Result<Account> {
        let _guard = self.lock_write(ctx, account_id).await?;
        ensure_active(ctx)?;

        if self.store.account_exists(account_id).await? {
            return Err(Error::AlreadyExists {
                kind: "account".to_string(),
                id: account_id.to_string(),
            });
        }

        let account = Account::new(account_id, owner_id, domain);
        self.store.save_account(&account).await?;
        info!("Created account {} owned by {}", account_id, owner_id);
        Ok(account)
    }

    pub async fn get_account(&self, ctx: &CancellationToken, account_id: &str) -> Result<Account> {
        self.snapshot(ctx, account_id).await
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub async fn get_group(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group_id: &str,
    ) -> Result<Group> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        account.get_group(group_id).cloned()
    }

    pub async fn list_groups(&self, ctx: &CancellationToken, account_id: &str, user_id: &str) -> Result<Vec<Group>> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        Ok(account.groups.into_values().collect())
    }

    pub async fn save_group(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group: Group,
    ) -> Result<Group> {
        let mut saved = self.save_groups(ctx, account_id, user_id, vec![group]).await?;
        saved
            .pop()
            .ok_or_else(|| Error::Internal("saved group missing from result".to_string()))
    }

    /// Save every group or none of them
    pub async fn save_groups(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        groups: Vec<Group>,
    ) -> Result<Vec<Group>> {
        self.mutate(ctx, account_id, "save groups", |account| {
            authorize_admin(account, user_id)?;
            let saved = groups::save_groups(account, groups)?;
            let ids: Vec<String> = saved.iter().map(|g| g.id.clone()).collect();
            let applied = changed(account, Change::Groups(&ids));
            Ok((saved, applied))
        })
        .await
    }

    pub async fn delete_group(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete group", |account| {
            let actor = authorize_admin(account, user_id)?;
            groups::delete_group(account, group_id, &actor)?;
            let ids = [group_id.to_string()];
            Ok(((), changed(account, Change::Groups(&ids))))
        })
        .await
    }

    /// Delete each group independently.
    ///
    /// Deletions that pass are committed together; the others are reported
    /// in the returned [`BatchError`].
    pub async fn delete_groups(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group_ids: &[String],
    ) -> Result<()> {
        let batch = self
            .mutate(ctx, account_id, "delete groups", |account| {
                let actor = authorize_admin(account, user_id)?;
                let mut batch = BatchError::new();
                let mut deleted = Vec::new();

                for group_id in group_ids {
                    match groups::delete_group(account, group_id, &actor) {
                        Ok(_) => deleted.push(group_id.clone()),
                        Err(e) => {
                            debug!("Group {} not deleted: {}", group_id, e);
                            batch.push(group_id.as_str(), e);
                        }
                    }
                }

                let applied = if deleted.is_empty() {
                    Applied::Unchanged
                } else {
                    changed(account, Change::Groups(&deleted))
                };
                Ok((batch, applied))
            })
            .await?;
        batch.into_result()
    }

    pub async fn group_add_peer(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group_id: &str,
        peer_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "add peer to group", |account| {
            authorize_admin(account, user_id)?;
            if !groups::add_peer(account, group_id, peer_id)? {
                return Ok(((), Applied::Unchanged));
            }
            let ids = [group_id.to_string()];
            Ok(((), changed(account, Change::Groups(&ids))))
        })
        .await
    }

    pub async fn group_remove_peer(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        group_id: &str,
        peer_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "remove peer from group", |account| {
            authorize_admin(account, user_id)?;
            if !groups::remove_peer(account, group_id, peer_id)? {
                return Ok(((), Applied::Unchanged));
            }
            let ids = [group_id.to_string()];
            Ok(((), changed(account, Change::Groups(&ids))))
        })
        .await
    }

    // ========================================================================
    // Policies
    // ========================================================================

    /// Create or replace a policy. Policies and rules without IDs get one.
    pub async fn save_policy(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut policy: Policy,
    ) -> Result<Policy> {
        self.mutate(ctx, account_id, "save policy", move |account| {
            authorize_admin(account, user_id)?;
            assign_id(&mut policy.id);
            for rule in &mut policy.rules {
                assign_id(&mut rule.id);
            }
            validation::validate_policy(account, &policy)?;

            let old = match account.policies.iter().position(|p| p.id == policy.id) {
                Some(pos) => Some(std::mem::replace(&mut account.policies[pos], policy.clone())),
                None => {
                    account.policies.push(policy.clone());
                    None
                }
            };
            let applied = changed(
                account,
                Change::Policy {
                    old: old.as_ref(),
                    new: Some(&policy),
                },
            );
            Ok((policy, applied))
        })
        .await
    }

    pub async fn get_policy(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        policy_id: &str,
    ) -> Result<Policy> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        account.get_policy(policy_id).cloned()
    }

    pub async fn list_policies(&self, ctx: &CancellationToken, account_id: &str, user_id: &str) -> Result<Vec<Policy>> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        Ok(account.policies)
    }

    pub async fn delete_policy(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        policy_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete policy", |account| {
            authorize_admin(account, user_id)?;
            let pos = account
                .policies
                .iter()
                .position(|p| p.id == policy_id)
                .ok_or_else(|| Error::not_found("policy", policy_id))?;
            let old = account.policies.remove(pos);
            let applied = changed(
                account,
                Change::Policy {
                    old: Some(&old),
                    new: None,
                },
            );
            Ok(((), applied))
        })
        .await
    }

    // ========================================================================
    // Routes
    // ========================================================================

    pub async fn create_route(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut route: Route,
    ) -> Result<Route> {
        self.mutate(ctx, account_id, "create route", move |account| {
            authorize_admin(account, user_id)?;
            assign_id(&mut route.id);
            if route.net_id.is_empty() {
                route.net_id = route.id.clone();
            }
            if account.routes.contains_key(&route.id) {
                return Err(Error::AlreadyExists {
                    kind: "route".to_string(),
                    id: route.id,
                });
            }
            validation::validate_route(account, &route)?;

            account.routes.insert(route.id.clone(), route.clone());
            let applied = changed(
                account,
                Change::Route {
                    old: None,
                    new: Some(&route),
                },
            );
            Ok((route, applied))
        })
        .await
    }

    pub async fn delete_route(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        route_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete route", |account| {
            authorize_admin(account, user_id)?;
            let old = account
                .routes
                .remove(route_id)
                .ok_or_else(|| Error::not_found("route", route_id))?;
            let applied = changed(
                account,
                Change::Route {
                    old: Some(&old),
                    new: None,
                },
            );
            Ok(((), applied))
        })
        .await
    }

    // ========================================================================
    // DNS
    // ========================================================================

    pub async fn create_name_server_group(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut ns: NameServerGroup,
    ) -> Result<NameServerGroup> {
        self.mutate(ctx, account_id, "create name server group", move |account| {
            authorize_admin(account, user_id)?;
            assign_id(&mut ns.id);
            if account.name_server_groups.contains_key(&ns.id) {
                return Err(Error::AlreadyExists {
                    kind: "name server group".to_string(),
                    id: ns.id,
                });
            }
            validation::validate_name_server_group(account, &ns)?;

            account.name_server_groups.insert(ns.id.clone(), ns.clone());
            let applied = changed(
                account,
                Change::NameServerGroup {
                    old: None,
                    new: Some(&ns),
                },
            );
            Ok((ns, applied))
        })
        .await
    }

    pub async fn delete_name_server_group(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        ns_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete name server group", |account| {
            authorize_admin(account, user_id)?;
            let old = account
                .name_server_groups
                .remove(ns_id)
                .ok_or_else(|| Error::not_found("name server group", ns_id))?;
            let applied = changed(
                account,
                Change::NameServerGroup {
                    old: Some(&old),
                    new: None,
                },
            );
            Ok(((), applied))
        })
        .await
    }

    pub async fn get_dns_settings(&self, ctx: &CancellationToken, account_id: &str, user_id: &str) -> Result<DnsSettings> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        Ok(account.dns_settings)
    }

    pub async fn save_dns_settings(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        settings: DnsSettings,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "save dns settings", move |account| {
            authorize_admin(account, user_id)?;
            validation::validate_dns_settings(account, &settings)?;
            if account.dns_settings == settings {
                return Ok(((), Applied::Unchanged));
            }
            let old = std::mem::replace(&mut account.dns_settings, settings);
            let applied = changed(
                account,
                Change::DnsSettings {
                    old: &old,
                    new: &account.dns_settings,
                },
            );
            Ok(((), applied))
        })
        .await
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub async fn create_network(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut network: Network,
    ) -> Result<Network> {
        self.mutate(ctx, account_id, "create network", move |account| {
            authorize_admin(account, user_id)?;
            if network.name.trim().is_empty() {
                return Err(Error::validation("network name shouldn't be empty"));
            }
            assign_id(&mut network.id);
            if account.networks.contains_key(&network.id) {
                return Err(Error::AlreadyExists {
                    kind: "network".to_string(),
                    id: network.id,
                });
            }
            account.networks.insert(network.id.clone(), network.clone());
            // An empty network has no routers, so no map can change
            Ok((network, Applied::Changed(Impact::Unaffected)))
        })
        .await
    }

    pub async fn create_network_resource(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut resource: NetworkResource,
    ) -> Result<NetworkResource> {
        self.mutate(ctx, account_id, "create network resource", move |account| {
            authorize_admin(account, user_id)?;
            assign_id(&mut resource.id);
            validation::validate_network_resource(account, &resource)?;
            account
                .network_resources
                .insert(resource.id.clone(), resource.clone());
            let applied = changed(
                account,
                Change::NetworkResource {
                    network_id: &resource.network_id,
                },
            );
            Ok((resource, applied))
        })
        .await
    }

    pub async fn create_network_router(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        mut router: NetworkRouter,
    ) -> Result<NetworkRouter> {
        self.mutate(ctx, account_id, "create network router", move |account| {
            authorize_admin(account, user_id)?;
            assign_id(&mut router.id);
            validation::validate_network_router(account, &router)?;
            account
                .network_routers
                .insert(router.id.clone(), router.clone());
            let applied = changed(
                account,
                Change::NetworkRouter {
                    old: None,
                    new: Some(&router),
                },
            );
            Ok((router, applied))
        })
        .await
    }

    pub async fn delete_network_router(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        router_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete network router", |account| {
            authorize_admin(account, user_id)?;
            let old = account
                .network_routers
                .remove(router_id)
                .ok_or_else(|| Error::not_found("network router", router_id))?;
            let applied = changed(
                account,
                Change::NetworkRouter {
                    old: Some(&old),
                    new: None,
                },
            );
            Ok(((), applied))
        })
        .await
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Enroll a peer with a setup key or on behalf of a user
    pub async fn add_peer(&self, ctx: &CancellationToken, account_id: &str, request: PeerEnrollment) -> Result<Peer> {
        self.mutate(ctx, account_id, "add peer", move |account| {
            let now = chrono::Utc::now().timestamp();
            let enrollment = peers::authorize_enrollment(account, &request, now)?;

            let mut peer = Peer::new(new_id(), request.key.as_str(), peers::allocate_ip(account)?);
            if !request.name.is_empty() {
                peer.name = request.name.clone();
            }
            peer.dns_label = peers::dns_label(account, &peer.name);
            peer.user_id = enrollment.user_id;
            account.peers.insert(peer.id.clone(), peer.clone());

            // All holds the peer implicitly even when its member list is stale
            let all_id = account.all_group_id.clone();
            let mut joined = vec![all_id.clone()];
            for group in account.groups.values_mut() {
                if group.id == all_id {
                    group.add_peer(&peer.id);
                } else if enrollment.auto_groups.contains(&group.id) && group.add_peer(&peer.id) {
                    joined.push(group.id.clone());
                }
            }
            debug!("Peer {} ({}) joined {} group(s)", peer.name, peer.ip, joined.len());

            let applied = changed(account, Change::Groups(&joined));
            Ok((peer, applied))
        })
        .await
    }

    /// Remove a peer and drop it from every group
    pub async fn delete_peer(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        peer_id: &str,
    ) -> Result<()> {
        self.mutate(ctx, account_id, "delete peer", |account| {
            authorize_admin(account, user_id)?;
            account.get_peer(peer_id)?;

            if let Some(route) = account
                .routes
                .values()
                .find(|r| r.peer.as_deref() == Some(peer_id))
            {
                return Err(Error::validation(format!(
                    "peer {} is the routing peer of route {}",
                    peer_id, route.net_id
                )));
            }
            if let Some(router) = account
                .network_routers
                .values()
                .find(|r| r.peer.as_deref() == Some(peer_id))
            {
                return Err(Error::validation(format!(
                    "peer {} is the routing peer of network router {}",
                    peer_id, router.id
                )));
            }

            let mut touched = groups::remove_peer_everywhere(account, peer_id);
            if !touched.contains(&account.all_group_id) {
                touched.push(account.all_group_id.clone());
            }
            account.peers.remove(peer_id);
            Ok(((), changed(account, Change::Groups(&touched))))
        })
        .await?;

        self.updates.close_channel(peer_id);
        Ok(())
    }

    /// Mark the peer connected and open its update channel.
    ///
    /// The channel is registered under the account lock, so no commit can
    /// slip between the returned map and the first queued update.
    pub async fn sync_peer(&self, ctx: &CancellationToken, account_id: &str, peer_id: &str) -> Result<PeerSession> {
        let _guard = self.lock_write(ctx, account_id).await?;
        ensure_active(ctx)?;

        let mut account = self.store.load_account(account_id).await?;
        let peer = account
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::not_found("peer", peer_id))?;
        peer.status.connected = true;
        peer.status.last_seen = chrono::Utc::now().timestamp();
        self.store.save_account(&account).await?;

        let network_map = NetworkMapBuilder::new(&account).build(peer_id)?;
        let updates = self.updates.create_channel(peer_id);
        info!("Peer {} connected to account {}", peer_id, account_id);

        Ok(PeerSession { updates, network_map })
    }

    pub async fn disconnect_peer(&self, ctx: &CancellationToken, account_id: &str, peer_id: &str) -> Result<()> {
        let _guard = self.lock_write(ctx, account_id).await?;
        ensure_active(ctx)?;

        let mut account = self.store.load_account(account_id).await?;
        let peer = account
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::not_found("peer", peer_id))?;
        peer.status.connected = false;
        peer.status.last_seen = chrono::Utc::now().timestamp();
        self.store.save_account(&account).await?;

        self.updates.close_channel(peer_id);
        info!("Peer {} disconnected from account {}", peer_id, account_id);
        Ok(())
    }

    pub async fn get_network_map(&self, ctx: &CancellationToken, account_id: &str, peer_id: &str) -> Result<NetworkMap> {
        let account = self.snapshot(ctx, account_id).await?;
        NetworkMapBuilder::new(&account).build(peer_id)
    }

    /// Peers the given peer may connect to, not counting itself
    pub async fn get_accessible_peers(
        &self,
        ctx: &CancellationToken,
        account_id: &str,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Vec<Peer>> {
        let account = self.snapshot(ctx, account_id).await?;
        acting_user(&account, user_id)?;
        account.get_peer(peer_id)?;

        let accessible = PolicyEngine::new(&account).accessible_peers(peer_id);
        Ok(accessible
            .iter()
            .filter(|id| id.as_str() != peer_id)
            .filter_map(|id| account.peers.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use meshplane_common::{GroupIssued, UserRole};

    async fn manager() -> (AccountManager, CancellationToken) {
        let manager = AccountManager::new(Arc::new(MemoryStore::new()), Arc::new(PeersUpdateManager::default()));
        let ctx = CancellationToken::new();
        manager.create_account(&ctx, "acc", "owner", "example.com").await.unwrap();
        (manager, ctx)
    }

    #[tokio::test]
    async fn test_create_account_twice_fails() {
        let (manager, ctx) = manager().await;
        let err = manager
            .create_account(&ctx, "acc", "owner", "example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_regular_user_cannot_mutate() {
        let (manager, ctx) = manager().await;
        let mut account = manager.get_account(&ctx, "acc").await.unwrap();
        account
            .users
            .insert("bob".to_string(), User::new("bob", UserRole::User));
        manager.store().save_account(&account).await.unwrap();

        let err = manager
            .save_group(&ctx, "acc", "bob", Group::new("", "Dev"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), ADMIN_REQUIRED);
        assert!(manager.list_groups(&ctx, "acc", "bob").await.is_ok());

        let err = manager.list_groups(&ctx, "acc", "mallory").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_serial_bumps_only_on_change() {
        let (manager, ctx) = manager().await;
        manager
            .save_group(&ctx, "acc", "owner", Group::new("g", "G"))
            .await
            .unwrap();
        assert_eq!(manager.get_account(&ctx, "acc").await.unwrap().network.serial, 1);

        // Removing a non-member is a no-op
        let peer = manager
            .add_peer(
                &ctx,
                "acc",
                PeerEnrollment {
                    key: "wg1".to_string(),
                    user_id: Some("owner".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .group_remove_peer(&ctx, "acc", "owner", "g", &peer.id)
            .await
            .unwrap();
        assert_eq!(manager.get_account(&ctx, "acc").await.unwrap().network.serial, 2);
    }

    #[tokio::test]
    async fn test_add_peer_joins_all_and_auto_groups() {
        let (manager, ctx) = manager().await;
        manager
            .save_group(&ctx, "acc", "owner", Group::new("dev", "Dev"))
            .await
            .unwrap();
        let mut account = manager.get_account(&ctx, "acc").await.unwrap();
        account.users.get_mut("owner").unwrap().auto_groups = vec!["dev".to_string()];
        manager.store().save_account(&account).await.unwrap();

        let peer = manager
            .add_peer(
                &ctx,
                "acc",
                PeerEnrollment {
                    key: "wg1".to_string(),
                    name: "Laptop".to_string(),
                    user_id: Some("owner".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(peer.dns_label, "laptop");
        assert_eq!(peer.user_id.as_deref(), Some("owner"));

        let account = manager.get_account(&ctx, "acc").await.unwrap();
        assert!(account.group_all().unwrap().contains(&peer.id));
        assert!(account.groups["dev"].contains(&peer.id));
    }

    #[tokio::test]
    async fn test_sync_and_disconnect() {
        let (manager, ctx) = manager().await;
        let peer = manager
            .add_peer(
                &ctx,
                "acc",
                PeerEnrollment {
                    key: "wg1".to_string(),
                    user_id: Some("owner".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let session = manager.sync_peer(&ctx, "acc", &peer.id).await.unwrap();
        assert!(session.network_map.can_reach(&peer.id));
        assert!(manager.updates().has_channel(&peer.id));
        let account = manager.get_account(&ctx, "acc").await.unwrap();
        assert!(account.peers[&peer.id].status.connected);

        manager.disconnect_peer(&ctx, "acc", &peer.id).await.unwrap();
        assert!(!manager.updates().has_channel(&peer.id));
        let account = manager.get_account(&ctx, "acc").await.unwrap();
        assert!(!account.peers[&peer.id].status.connected);
    }

    #[tokio::test]
    async fn test_delete_peer_refused_for_route_peer() {
        let (manager, ctx) = manager().await;
        let peer = manager
            .add_peer(
                &ctx,
                "acc",
                PeerEnrollment {
                    key: "wg1".to_string(),
                    user_id: Some("owner".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let all = manager
            .get_account(&ctx, "acc")
            .await
            .unwrap()
            .group_all()
            .unwrap()
            .id
            .clone();

        let mut route = Route::new("", "10.0.0.0/8".parse().unwrap());
        route.peer = Some(peer.id.clone());
        route.groups = vec![all];
        let route = manager.create_route(&ctx, "acc", "owner", route).await.unwrap();

        assert!(matches!(
            manager.delete_peer(&ctx, "acc", "owner", &peer.id).await,
            Err(Error::Validation(_))
        ));

        manager.delete_route(&ctx, "acc", "owner", &route.id).await.unwrap();
        manager.delete_peer(&ctx, "acc", "owner", &peer.id).await.unwrap();
        let account = manager.get_account(&ctx, "acc").await.unwrap();
        assert!(account.peers.is_empty());
        assert!(account.group_all().unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_policy_upsert_and_delete() {
        let (manager, ctx) = manager().await;
        manager
            .save_group(&ctx, "acc", "owner", Group::new("g", "G"))
            .await
            .unwrap();
        let policy = Policy {
            name: "g-to-g".to_string(),
            rules: vec![meshplane_common::PolicyRule {
                sources: vec!["g".to_string()],
                destinations: vec!["g".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut saved = manager.save_policy(&ctx, "acc", "owner", policy).await.unwrap();
        assert!(!saved.id.is_empty());
        assert!(!saved.rules[0].id.is_empty());

        saved.description = "updated".to_string();
        manager.save_policy(&ctx, "acc", "owner", saved.clone()).await.unwrap();
        assert_eq!(manager.list_policies(&ctx, "acc", "owner").await.unwrap().len(), 2);
        let fetched = manager.get_policy(&ctx, "acc", "owner", &saved.id).await.unwrap();
        assert_eq!(fetched.description, "updated");

        manager.delete_policy(&ctx, "acc", "owner", &saved.id).await.unwrap();
        assert!(manager
            .get_policy(&ctx, "acc", "owner", &saved.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_context_persists_nothing() {
        let (manager, _) = manager().await;
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = manager
            .save_group(&ctx, "acc", "owner", Group::new("g", "G"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let live = CancellationToken::new();
        let account = manager.get_account(&live, "acc").await.unwrap();
        assert!(!account.groups.contains_key("g"));
        assert_eq!(account.network.serial, 0);
    }

    #[tokio::test]
    async fn test_integration_group_roundtrip() {
        let (manager, ctx) = manager().await;
        let group = Group::new("int", "Synced").with_issued(GroupIssued::Integration);
        manager.save_group(&ctx, "acc", "owner", group).await.unwrap();
        let fetched = manager.get_group(&ctx, "acc", "owner", "int").await.unwrap();
        assert_eq!(fetched.issued, GroupIssued::Integration);
        assert_eq!(fetched.account_id, "acc");
    }
}
