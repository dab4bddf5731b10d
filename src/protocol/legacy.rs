//! Legacy (P5) multicast propagation for pre-1.0 peers.
//!
//! Frames carry a GUID (origin address + per-origin counter) and a 1024-byte
//! bloom filter of nodes that have already been sent a copy. Every node
//! remembers recent GUIDs so a frame is handled at most once. Directory nodes
//! fan frames out to group members that cannot speak the newer multicast
//! verbs; everyone else hands the frame to a directory node once.

use crate::config::{MulticastConfig, LEGACY_RELAY_LIMIT};
use crate::core::address::Address;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::node::{Peer, RuntimeEnvironment};
use crate::protocol::message::{P5MulticastFrame, P5_IDX_BLOOM, P5_IDX_DEPTH, P5_LEN_BLOOM};
use crate::utils::dedup::GuidHistory;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Depth written by a directory node when it fans a frame out.
pub const DEPTH_FANNED_OUT: u16 = 0xffff;

/// Depth written by a leaf when it hands a frame to a directory node. Tells
/// the directory node to treat the sender as legacy.
pub const DEPTH_FROM_LEAF: u16 = 0xbeef;

const BLOOM_BITS: u64 = (P5_LEN_BLOOM * 8) as u64;

/// Bloom filter bit for `address` under a per-frame nonce.
pub fn bloom_bit(address: Address, nonce: u16) -> usize {
    let mut a = address.to_u64() + u64::from(nonce);
    let mut bit = 0u64;
    for _ in 0..4 {
        bit ^= a & (BLOOM_BITS - 1);
        a >>= 13;
    }
    (bit & (BLOOM_BITS - 1)) as usize
}

/// Propagation bloom filter over a frame's bloom bytes.
pub struct PropagationBloom<'a> {
    bits: &'a mut [u8],
    nonce: u16,
}

impl<'a> PropagationBloom<'a> {
    pub fn new(bits: &'a mut [u8], nonce: u16) -> Self {
        Self { bits, nonce }
    }

    pub fn contains(&self, address: Address) -> bool {
        let bit = bloom_bit(address, self.nonce);
        self.bits
            .get(bit >> 3)
            .is_some_and(|b| b & (0x80 >> (bit & 7)) != 0)
    }

    pub fn insert(&mut self, address: Address) {
        let bit = bloom_bit(address, self.nonce);
        if let Some(b) = self.bits.get_mut(bit >> 3) {
            *b |= 0x80 >> (bit & 7);
        }
    }
}

/// Dedup history and relay policy, one per dispatcher.
#[derive(Debug)]
pub struct LegacyRelay {
    history: Mutex<GuidHistory>,
    relay_limit: usize,
    enabled: bool,
}

impl LegacyRelay {
    pub fn new(config: &MulticastConfig) -> Self {
        Self {
            history: Mutex::new(GuidHistory::with_capacity(config.legacy_dedup_capacity)),
            relay_limit: config.legacy_relay_limit,
            enabled: config.legacy_relay_enabled,
        }
    }

    /// Record `guid`, reporting whether it was seen before.
    pub fn is_duplicate(&self, guid: u64) -> Result<bool> {
        let mut history = self
            .history
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_HISTORY_LOCK))?;
        Ok(history.check_and_insert(guid))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Re-propagate an accepted frame. Returns the number of copies sent.
    pub fn relay(
        &self,
        env: &RuntimeEnvironment,
        sender: &Peer,
        packet: &Packet,
        frame: &P5MulticastFrame<'_>,
    ) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let me = env.address();
        let origin = frame.origin();

        if env.topology.am_supernode() {
            let sender_is_legacy =
                sender.remote_version_major() < 1 || frame.depth == DEPTH_FROM_LEAF;

            let mut out = packet.clone();
            let mut recipients = Vec::new();
            {
                let bits = out.payload_window_mut(P5_IDX_BLOOM, P5_LEN_BLOOM)?;
                let mut bloom = PropagationBloom::new(bits, frame.bloom_nonce);
                let limit = self.relay_limit.min(LEGACY_RELAY_LIMIT);
                for member in env.multicaster.get_members(frame.network_id, frame.group, limit) {
                    if member == origin || member == sender.address() || member == me {
                        continue;
                    }
                    let wants_legacy = sender_is_legacy
                        || env
                            .topology
                            .get_peer(member)
                            .map_or(true, |p| p.remote_version_major() < 1);
                    if !wants_legacy || bloom.contains(member) {
                        continue;
                    }
                    bloom.insert(member);
                    recipients.push(member);
                }
            }
            if recipients.is_empty() {
                return Ok(0);
            }

            out.set_payload_u16(P5_IDX_DEPTH, DEPTH_FANNED_OUT)?;
            out.set_source(me);
            out.compress();
            for r in &recipients {
                let mut copy = out.clone();
                copy.new_initialization_vector();
                copy.set_destination(*r);
                env.switch.send(copy, true)?;
            }
            trace!(guid = format_args!("{:016x}", frame.guid), copies = recipients.len(), "legacy multicast fanned out");
            Ok(recipients.len())
        } else if !env.topology.is_supernode(sender.address()) {
            let Some(supernode) = env.topology.best_supernode() else {
                debug!("no directory node to hand legacy multicast to");
                return Ok(0);
            };
            let mut out = packet.clone();
            out.set_payload_u16(P5_IDX_DEPTH, DEPTH_FROM_LEAF)?;
            out.new_initialization_vector();
            out.set_destination(supernode.address());
            out.set_source(me);
            out.compress();
            env.switch.send(out, true)?;
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_bit_in_range_and_nonce_dependent() {
        let a = Address::new(0x89e9_2cee_e5);
        for nonce in [0u16, 1, 0x7fff, 0xffff] {
            assert!(bloom_bit(a, nonce) < P5_LEN_BLOOM * 8);
        }
        assert_ne!(bloom_bit(a, 0), bloom_bit(a, 1));
    }

    #[test]
    fn test_bloom_bit_folds_thirteen_bit_groups() {
        // 0x2001 folds to 0x0001 ^ 0x0001 = 0
        assert_eq!(bloom_bit(Address::new(0x2001), 0), 0);
        assert_eq!(bloom_bit(Address::new(0x5), 0), 5);
        assert_eq!(bloom_bit(Address::new(0x4), 1), 5);
    }

    #[test]
    fn test_bloom_insert_and_contains() {
        let mut bits = vec![0u8; P5_LEN_BLOOM];
        let mut bloom = PropagationBloom::new(&mut bits, 42);
        let a = Address::new(0x0102030405);
        assert!(!bloom.contains(a));
        bloom.insert(a);
        assert!(bloom.contains(a));
        let set = bits.iter().map(|b| b.count_ones()).sum::<u32>();
        assert_eq!(set, 1);
    }

    #[test]
    fn test_bit_order_is_msb_first() {
        let mut bits = vec![0u8; P5_LEN_BLOOM];
        PropagationBloom::new(&mut bits, 0).insert(Address::new(9));
        assert_eq!(bits[1], 0x40);
    }

    #[test]
    fn test_history_dedups() {
        let relay = LegacyRelay::new(&MulticastConfig::default());
        assert!(!relay.is_duplicate(7).unwrap());
        assert!(relay.is_duplicate(7).unwrap());
    }
}
