//! Duplicate suppression for relayed legacy multicast frames.
//!
//! Frames are identified by a 64-bit GUID (origin address plus a per-origin
//! counter). The history is a fixed ring: once full, the oldest GUID is
//! forgotten to make room, so memory stays bounded no matter how many
//! distinct frames pass through.

use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Bounded set of recently seen frame GUIDs with FIFO eviction.
#[derive(Debug)]
pub struct GuidHistory {
    seen: HashSet<u64>,
    /// Insertion order for FIFO eviction
    order: VecDeque<u64>,
    capacity: usize,
}

impl GuidHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `guid`. Returns true if it was already present.
    ///
    /// Check and insert happen together so two concurrent callers holding
    /// the same lock can never both see a GUID as new.
    pub fn check_and_insert(&mut self, guid: u64) -> bool {
        if self.seen.contains(&guid) {
            trace!(guid = format_args!("{guid:016x}"), "duplicate multicast GUID");
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(guid);
        self.order.push_back(guid);
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
