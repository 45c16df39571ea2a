#![allow(dead_code)]

use meshplane_common::{Account, Peer, User, UserRole};
use meshplane_management::{AccountManager, MemoryStore, PeersUpdateManager, Store, UpdateMessage};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

pub const ACCOUNT: &str = "test-account";
pub const OWNER: &str = "owner";

/// Account with `peers` enrolled directly, all members of "All"
pub fn account_with_peers(peers: usize) -> Account {
    let mut account = Account::new(ACCOUNT, OWNER, "meshplane.test");
    for i in 0..peers {
        let id = format!("peer-{}", i + 1);
        let octets = ((i + 1) as u32).to_be_bytes();
        let ip = Ipv4Addr::new(100, 64, octets[2], octets[3]);
        account
            .peers
            .insert(id.clone(), Peer::new(id.as_str(), format!("key-{}", id), ip));
    }
    let peer_ids: Vec<String> = account.peers.keys().cloned().collect();
    if let Some(all) = account.groups.get_mut(&account.all_group_id) {
        all.peers = peer_ids;
    }
    account
        .users
        .insert("service".to_string(), User::service("service", UserRole::Admin));
    account
}

pub async fn manager_for(account: Account) -> (Arc<AccountManager>, CancellationToken) {
    let store = Arc::new(MemoryStore::new());
    store.save_account(&account).await.unwrap();
    let manager = AccountManager::new(store, Arc::new(PeersUpdateManager::default()));
    (Arc::new(manager), CancellationToken::new())
}

/// Next queued update, failing when nothing was pushed
pub fn expect_update(rx: &mut mpsc::Receiver<UpdateMessage>, step: &str) -> UpdateMessage {
    match rx.try_recv() {
        Ok(msg) => msg,
        Err(e) => panic!("{}: expected a peer update, got {:?}", step, e),
    }
}

pub fn expect_no_update(rx: &mut mpsc::Receiver<UpdateMessage>, step: &str) {
    match rx.try_recv() {
        Err(TryRecvError::Empty) => {}
        Ok(msg) => panic!("{}: unexpected update at serial {}", step, msg.network_map.serial),
        Err(e) => panic!("{}: channel broken: {:?}", step, e),
    }
}
