//! Peer update bus
//!
//! One bounded queue per connected peer. Sending never waits: updates for
//! offline peers are dropped and the peer picks up current state on its
//! next sync.

use crate::network_map::NetworkMap;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Per-peer queue depth used when none is configured
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Message pushed to a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub network_map: NetworkMap,
}

/// Outcome of one [`PeersUpdateManager::send_update`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Peer has no open channel
    NoChannel,
    /// Queue full, update dropped
    Busy,
    /// Receiver gone, channel removed
    Closed,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// Channel table keyed by peer ID
pub struct PeersUpdateManager {
    channels: DashMap<String, mpsc::Sender<UpdateMessage>>,
    buffer: usize,
}

impl Default for PeersUpdateManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_BUFFER)
    }
}

impl PeersUpdateManager {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open a channel for the peer, superseding any previous one
    pub fn create_channel(&self, peer_id: &str) -> mpsc::Receiver<UpdateMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.channels.insert(peer_id.to_string(), tx).is_some() {
            debug!("Replaced update channel for peer {}", peer_id);
        } else {
            debug!("Opened update channel for peer {}", peer_id);
        }
        rx
    }

    /// Remove the peer's channel. Returns false when none was open.
    pub fn close_channel(&self, peer_id: &str) -> bool {
        let closed = self.channels.remove(peer_id).is_some();
        if closed {
            debug!("Closed update channel for peer {}", peer_id);
        }
        closed
    }

    /// Queue an update without waiting
    pub fn send_update(&self, peer_id: &str, message: UpdateMessage) -> Delivery {
        let sender = match self.channels.get(peer_id) {
            Some(entry) => entry.value().clone(),
            None => return Delivery::NoChannel,
        };

        match sender.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                warn!("Update channel for peer {} is full, dropping update", peer_id);
                Delivery::Busy
            }
            Err(TrySendError::Closed(_)) => {
                // A reconnect may have installed a fresh channel meanwhile
                self.channels
                    .remove_if(peer_id, |_, current| current.same_channel(&sender));
                debug!("Removed closed update channel for peer {}", peer_id);
                Delivery::Closed
            }
        }
    }

    /// Drop channels whose receivers are gone. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| !sender.is_closed());
        before.saturating_sub(self.channels.len())
    }

    pub fn has_channel(&self, peer_id: &str) -> bool {
        self.channels.contains_key(peer_id)
    }

    /// IDs of peers holding a channel, sorted
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn message(peer_id: &str, serial: u64) -> UpdateMessage {
        UpdateMessage {
            network_map: NetworkMap {
                peer_id: peer_id.to_string(),
                serial,
                accessible_peers: BTreeSet::new(),
                firewall_rules: BTreeSet::new(),
                routes: Vec::new(),
                resources: Vec::new(),
                route_peers: BTreeSet::new(),
                name_server_groups: Vec::new(),
                dns_management_enabled: true,
            },
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let bus = PeersUpdateManager::default();
        let mut rx = bus.create_channel("p1");
        assert_eq!(bus.send_update("p1", message("p1", 1)), Delivery::Sent);
        assert_eq!(rx.recv().await.unwrap().network_map.serial, 1);
    }

    #[test]
    fn test_missing_channel_drops() {
        let bus = PeersUpdateManager::default();
        assert_eq!(bus.send_update("p1", message("p1", 1)), Delivery::NoChannel);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_channel() {
        let bus = PeersUpdateManager::default();
        let mut first = bus.create_channel("p1");
        let mut second = bus.create_channel("p1");
        assert_eq!(bus.channel_count(), 1);

        assert!(bus.send_update("p1", message("p1", 7)).is_sent());
        assert_eq!(second.recv().await.unwrap().network_map.serial, 7);
        assert!(first.recv().await.is_none());
    }

    #[test]
    fn test_closed_receiver_is_cleaned_up() {
        let bus = PeersUpdateManager::default();
        let rx = bus.create_channel("p1");
        drop(rx);
        assert_eq!(bus.send_update("p1", message("p1", 1)), Delivery::Closed);
        assert!(!bus.has_channel("p1"));
    }

    #[test]
    fn test_full_queue_does_not_block() {
        let bus = PeersUpdateManager::new(1);
        let _rx = bus.create_channel("p1");
        assert_eq!(bus.send_update("p1", message("p1", 1)), Delivery::Sent);
        assert_eq!(bus.send_update("p1", message("p1", 2)), Delivery::Busy);
        assert!(bus.has_channel("p1"));
    }

    #[test]
    fn test_prune_closed() {
        let bus = PeersUpdateManager::default();
        let _live = bus.create_channel("live");
        drop(bus.create_channel("gone"));
        assert_eq!(bus.prune_closed(), 1);
        assert_eq!(bus.connected_peers(), vec!["live"]);
    }

    #[test]
    fn test_close_channel() {
        let bus = PeersUpdateManager::default();
        let _a = bus.create_channel("b");
        let _b = bus.create_channel("a");
        assert_eq!(bus.connected_peers(), vec!["a", "b"]);
        assert!(bus.close_channel("a"));
        assert!(!bus.close_channel("a"));
        assert_eq!(bus.connected_peers(), vec!["b"]);
    }
}
