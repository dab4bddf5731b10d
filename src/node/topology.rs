//! Peer table and directory-node (supernode) designation.

use crate::core::address::Address;
use crate::error::constants;
use crate::node::peer::Peer;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Address-to-peer lookup and the set of trusted directory nodes.
pub trait Topology: Send + Sync {
    fn get_peer(&self, address: Address) -> Option<Arc<Peer>>;

    /// Insert `peer` unless a record for its address already exists, and
    /// return whichever record is now canonical. Concurrent callers racing
    /// on one address all get the same instance back.
    fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer>;

    fn is_supernode(&self, address: Address) -> bool;

    fn am_supernode(&self) -> bool;

    /// Preferred directory node to relay through, if any is known.
    fn best_supernode(&self) -> Option<Arc<Peer>>;
}

/// In-memory [`Topology`].
#[derive(Debug)]
pub struct PeerTable {
    local: Address,
    supernodes: BTreeSet<Address>,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new(local: Address, supernodes: impl IntoIterator<Item = Address>) -> Self {
        Self {
            local,
            supernodes: supernodes.into_iter().collect(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn supernodes(&self) -> impl Iterator<Item = Address> + '_ {
        self.supernodes.iter().copied()
    }
}

impl Topology for PeerTable {
    fn get_peer(&self, address: Address) -> Option<Arc<Peer>> {
        match self.peers.read() {
            Ok(peers) => peers.get(&address).cloned(),
            Err(_) => {
                warn!("{}", constants::ERR_TOPOLOGY_LOCK);
                None
            }
        }
    }

    fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut peers = match self.peers.write() {
            Ok(p) => p,
            Err(_) => {
                warn!("{}", constants::ERR_TOPOLOGY_LOCK);
                return peer;
            }
        };
        let canonical = peers.entry(peer.address()).or_insert_with(|| {
            debug!(peer = %peer.address(), "peer added");
            Arc::clone(&peer)
        });
        Arc::clone(canonical)
    }

    fn is_supernode(&self, address: Address) -> bool {
        self.supernodes.contains(&address)
    }

    fn am_supernode(&self) -> bool {
        self.supernodes.contains(&self.local)
    }

    fn best_supernode(&self) -> Option<Arc<Peer>> {
        let peers = self.peers.read().ok()?;
        self.supernodes
            .iter()
            .filter(|a| **a != self.local)
            .filter_map(|a| peers.get(a))
            // measured latency first, lowest wins
            .min_by_key(|p| {
                let latency = p.latency().unwrap_or(0);
                (latency == 0, latency)
            })
            .cloned()
    }
}
