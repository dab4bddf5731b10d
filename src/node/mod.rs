//! # Node Collaborators
//!
//! Everything the packet dispatcher reads or mutates lives behind the traits
//! in this module. Each is internally synchronized: the dispatcher holds no
//! locks of its own and may run on any number of workers at once.
//!
//! ## Components
//! - **Peer**: per-peer shared key and liveness bookkeeping
//! - **Topology**: address to peer lookup, directory (supernode) trust
//! - **Network**: joined networks, membership certificates, bridging, tap
//! - **Multicaster**: multicast group membership directory
//! - **Switch / Transport**: outbound packet paths
//! - **NetconfService**: external network configuration service

pub mod multicaster;
pub mod network;
pub mod peer;
pub mod topology;

use crate::core::address::Address;
use crate::core::dictionary::Dictionary;
use crate::core::identity::LocalIdentity;
use crate::core::packet::Packet;
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

pub use multicaster::{MulticastDirectory, Multicaster};
pub use network::{LocalNetwork, Network, NetworkConfig, NetworkStatus, Tap};
pub use peer::{Peer, RemoteVersion};
pub use topology::{PeerTable, Topology};

/// Raw datagram sink: "send these bytes to this address".
pub trait Transport: Send + Sync {
    fn send(&self, to: SocketAddr, data: &[u8]) -> Result<()>;
}

/// Routing and identity-resolution services owned by the host.
pub trait Switch: Send + Sync {
    /// Ask the directory for `address`'s identity.
    fn request_whois(&self, address: Address);

    /// Stop asking for `address`; the directory does not know it.
    fn cancel_whois(&self, address: Address);

    /// Attempt direct contact with `peer` at `endpoint`.
    fn contact(&self, peer: &Arc<Peer>, endpoint: SocketAddr);

    /// A new peer is known; flush anything queued for it.
    fn do_anything_waiting_for_peer(&self, peer: &Arc<Peer>);

    /// Armor and route a packet to its destination. The packet is not yet
    /// armored but may already be compressed.
    fn send(&self, packet: Packet, encrypt: bool) -> Result<()>;
}

/// Lookup of joined networks by ID.
pub trait NetworkDirectory: Send + Sync {
    fn network(&self, network_id: u64) -> Option<Arc<dyn Network>>;
}

/// External network configuration service (controller side).
pub trait NetconfService: Send + Sync {
    fn send(&self, request: &Dictionary) -> Result<()>;
}

/// In-memory [`NetworkDirectory`].
#[derive(Default)]
pub struct NetworkTable {
    networks: RwLock<HashMap<u64, Arc<dyn Network>>>,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, network: Arc<dyn Network>) {
        if let Ok(mut n) = self.networks.write() {
            n.insert(network.id(), network);
        }
    }

    pub fn leave(&self, network_id: u64) -> Option<Arc<dyn Network>> {
        self.networks.write().ok()?.remove(&network_id)
    }
}

impl NetworkDirectory for NetworkTable {
    fn network(&self, network_id: u64) -> Option<Arc<dyn Network>> {
        self.networks.read().ok()?.get(&network_id).cloned()
    }
}

/// Everything a dispatcher needs, bundled.
#[derive(Clone)]
pub struct RuntimeEnvironment {
    pub identity: Arc<LocalIdentity>,
    pub topology: Arc<dyn Topology>,
    pub switch: Arc<dyn Switch>,
    pub transport: Arc<dyn Transport>,
    pub networks: Arc<dyn NetworkDirectory>,
    pub multicaster: Arc<dyn Multicaster>,
    pub netconf: Option<Arc<dyn NetconfService>>,
}

impl RuntimeEnvironment {
    pub fn address(&self) -> Address {
        self.identity.address()
    }
}
