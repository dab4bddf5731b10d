//! Remote peer records.
//!
//! A peer's identity and shared key are fixed when the record is created;
//! the mutable bookkeeping (remote version, latency, liveness) sits behind a
//! mutex so packets from the same peer handled on different workers
//! serialize their updates.

use crate::core::address::Address;
use crate::core::identity::{Identity, LocalIdentity};
use crate::core::packet::KEY_LENGTH;
use crate::error::{constants, ProtocolError, Result};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Software and protocol version reported by a peer in HELLO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteVersion {
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

#[derive(Debug, Default)]
struct PeerState {
    version: Option<RemoteVersion>,
    latency_ms: u32,
    last_receive_ms: u64,
    last_remote: Option<SocketAddr>,
    last_verb: u8,
    last_hops: u8,
    packets_received: u64,
}

pub struct Peer {
    identity: Identity,
    key: Zeroizing<[u8; KEY_LENGTH]>,
    state: Mutex<PeerState>,
}

impl Peer {
    /// Create a record for `identity`, deriving the shared key with our own.
    pub fn new(local: &LocalIdentity, identity: Identity) -> Result<Self> {
        let key = local.agree(&identity)?;
        Ok(Self {
            identity,
            key,
            state: Mutex::new(PeerState::default()),
        })
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    fn state(&self) -> Result<MutexGuard<'_, PeerState>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_PEER_LOCK))
    }

    /// Bookkeeping for every authenticated packet from this peer.
    pub fn received(&self, remote: SocketAddr, hops: u8, verb: u8, now_ms: u64) -> Result<()> {
        let mut s = self.state()?;
        s.last_receive_ms = now_ms;
        s.last_verb = verb;
        s.last_hops = hops;
        if hops == 0 {
            s.last_remote = Some(remote);
        }
        s.packets_received += 1;
        Ok(())
    }

    pub fn set_remote_version(&self, version: RemoteVersion) -> Result<()> {
        self.state()?.version = Some(version);
        Ok(())
    }

    /// Fold a round-trip sample into the running latency estimate.
    pub fn add_direct_latency_measurement(&self, latency_ms: u32) -> Result<()> {
        let mut s = self.state()?;
        s.latency_ms = if s.latency_ms == 0 {
            latency_ms
        } else {
            (s.latency_ms + latency_ms) / 2
        };
        Ok(())
    }

    pub fn remote_version(&self) -> Result<Option<RemoteVersion>> {
        Ok(self.state()?.version)
    }

    /// Major software version, 0 when the peer never said.
    pub fn remote_version_major(&self) -> u8 {
        self.state()
            .ok()
            .and_then(|s| s.version)
            .map(|v| v.major)
            .unwrap_or(0)
    }

    pub fn latency(&self) -> Result<u32> {
        Ok(self.state()?.latency_ms)
    }

    pub fn last_receive(&self) -> Result<u64> {
        Ok(self.state()?.last_receive_ms)
    }

    /// Address of the last packet that reached us directly.
    pub fn direct_path(&self) -> Result<Option<SocketAddr>> {
        Ok(self.state()?.last_remote)
    }

    pub fn packets_received(&self) -> Result<u64> {
        Ok(self.state()?.packets_received)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.identity.address())
            .finish_non_exhaustive()
    }
}
