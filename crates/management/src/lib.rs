//! Meshplane Management
//!
//! Access-control evaluation and peer update propagation for mesh VPN
//! accounts: the group registry, referential integrity checks, the policy
//! engine, per-peer network maps and the update bus feeding connected
//! peers.

pub mod groups;
pub mod impact;
pub mod integrity;
pub mod locks;
pub mod manager;
pub mod network_map;
pub mod peers;
pub mod policy;
pub mod store;
pub mod update_channel;
pub mod validation;

pub use impact::{Change, Impact};
pub use manager::{AccountManager, Applied, PeerSession};
pub use network_map::{NetworkMap, NetworkMapBuilder, ResourceGrant, RouteDirection, RouteGrant};
pub use peers::PeerEnrollment;
pub use policy::{FirewallRule, GroupIndex, PolicyEngine, TrafficDirection};
pub use store::{MemoryStore, SqliteStore, Store};
pub use update_channel::{Delivery, PeersUpdateManager, UpdateMessage, DEFAULT_CHANNEL_BUFFER};
