//! Multicast group membership directory.

use crate::core::address::{Address, MulticastGroup};
use crate::error::constants;
use crate::protocol::message::GatherResults;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{trace, warn};

/// How long a LIKE keeps a member in a group without being refreshed.
pub const MULTICAST_LIKE_EXPIRE_MS: u64 = 600_000;

/// Which peers want which multicast groups on which networks.
pub trait Multicaster: Send + Sync {
    /// Record that `member` subscribes to `group`. `learned_from` is the
    /// node that told us, or the zero address when the member said so itself.
    fn add(&self, now_ms: u64, network_id: u64, group: MulticastGroup, learned_from: Address, member: Address);

    /// Record gather results relayed by `learned_from`. `total_known` is the
    /// sender's count of members, which may exceed `members.len()`.
    fn add_multiple(
        &self,
        now_ms: u64,
        network_id: u64,
        group: MulticastGroup,
        learned_from: Address,
        members: &[Address],
        total_known: u32,
    );

    /// Up to `limit` members of `group`, excluding `requester`.
    fn gather(&self, requester: Address, network_id: u64, group: MulticastGroup, limit: u32) -> GatherResults;

    /// Up to `limit` members of `group`, most recently seen first.
    fn get_members(&self, network_id: u64, group: MulticastGroup, limit: usize) -> Vec<Address>;
}

#[derive(Debug, Clone, Copy)]
struct Member {
    address: Address,
    learned_from: Address,
    last_seen_ms: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<Member>,
    total_known: u32,
}

impl GroupState {
    fn upsert(&mut self, now_ms: u64, learned_from: Address, address: Address) {
        match self.members.iter_mut().find(|m| m.address == address) {
            Some(m) => {
                m.last_seen_ms = now_ms;
                // a first-hand LIKE outranks hearsay
                if learned_from.is_zero() || !m.learned_from.is_zero() {
                    m.learned_from = learned_from;
                }
            }
            None => self.members.push(Member {
                address,
                learned_from,
                last_seen_ms: now_ms,
            }),
        }
    }
}

/// In-memory [`Multicaster`].
#[derive(Debug, Default)]
pub struct MulticastDirectory {
    groups: Mutex<BTreeMap<(u64, MulticastGroup), GroupState>>,
}

impl MulticastDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> Option<MutexGuard<'_, BTreeMap<(u64, MulticastGroup), GroupState>>> {
        match self.groups.lock() {
            Ok(g) => Some(g),
            Err(_) => {
                warn!("{}", constants::ERR_MULTICAST_LOCK);
                None
            }
        }
    }

    /// Forget members whose subscription has expired.
    pub fn clean(&self, now_ms: u64) {
        if let Some(mut groups) = self.groups() {
            groups.retain(|_, g| {
                g.members
                    .retain(|m| now_ms.saturating_sub(m.last_seen_ms) < MULTICAST_LIKE_EXPIRE_MS);
                g.total_known = g.total_known.min(g.members.len() as u32);
                !g.members.is_empty()
            });
        }
    }

    pub fn member_count(&self, network_id: u64, group: MulticastGroup) -> usize {
        self.groups()
            .and_then(|g| g.get(&(network_id, group)).map(|s| s.members.len()))
            .unwrap_or(0)
    }
}

impl Multicaster for MulticastDirectory {
    fn add(&self, now_ms: u64, network_id: u64, group: MulticastGroup, learned_from: Address, member: Address) {
        if let Some(mut groups) = self.groups() {
            let state = groups.entry((network_id, group)).or_default();
            state.upsert(now_ms, learned_from, member);
            trace!(nwid = format_args!("{network_id:016x}"), %group, %member, "multicast member");
        }
    }

    fn add_multiple(
        &self,
        now_ms: u64,
        network_id: u64,
        group: MulticastGroup,
        learned_from: Address,
        members: &[Address],
        total_known: u32,
    ) {
        if let Some(mut groups) = self.groups() {
            let state = groups.entry((network_id, group)).or_default();
            for m in members {
                state.upsert(now_ms, learned_from, *m);
            }
            state.total_known = state.total_known.max(total_known);
        }
    }

    fn gather(&self, requester: Address, network_id: u64, group: MulticastGroup, limit: u32) -> GatherResults {
        let Some(groups) = self.groups() else {
            return GatherResults::default();
        };
        let Some(state) = groups.get(&(network_id, group)) else {
            return GatherResults::default();
        };
        let candidates: Vec<Address> = state
            .members
            .iter()
            .map(|m| m.address)
            .filter(|a| *a != requester)
            .collect();
        let members = candidates
            .choose_multiple(&mut rand::rng(), limit as usize)
            .copied()
            .collect();
        GatherResults {
            total_known: state.total_known.max(candidates.len() as u32),
            members,
        }
    }

    fn get_members(&self, network_id: u64, group: MulticastGroup, limit: usize) -> Vec<Address> {
        let Some(groups) = self.groups() else {
            return Vec::new();
        };
        let Some(state) = groups.get(&(network_id, group)) else {
            return Vec::new();
        };
        let mut members = state.members.clone();
        members.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        members.into_iter().take(limit).map(|m| m.address).collect()
    }
}
