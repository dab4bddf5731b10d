//! Observability and Metrics
//!
//! Counters for packet processing, kept per dispatcher so that several
//! nodes in one process (or one test) do not share totals.
//!
//! Uses atomic counters for thread-safe metrics collection.

use crate::protocol::DropReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one packet dispatcher
#[derive(Debug)]
pub struct Metrics {
    /// Packets handed to the dispatcher
    pub packets_received: AtomicU64,
    /// Bytes handed to the dispatcher
    pub bytes_received: AtomicU64,
    /// Packets that reached a verb handler
    pub packets_processed: AtomicU64,
    /// Packets silently dropped
    pub packets_dropped: AtomicU64,
    /// Drops split by reason, indexed by `DropReason as usize`
    drops_by_reason: [AtomicU64; DropReason::COUNT],
    /// Packets that failed MAC verification
    pub authentication_failures: AtomicU64,
    /// Packets deferred until the sender's identity is known
    pub awaiting_identity: AtomicU64,
    /// Replies and relayed packets sent
    pub packets_sent: AtomicU64,
    /// Bytes of replies and relayed packets sent
    pub bytes_sent: AtomicU64,
    /// Ethernet frames delivered to a tap
    pub frames_delivered: AtomicU64,
    /// Legacy multicast frames suppressed as duplicates
    pub legacy_duplicates: AtomicU64,
    /// Legacy multicast frames relayed (one per recipient)
    pub legacy_relayed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_processed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            drops_by_reason: std::array::from_fn(|_| AtomicU64::new(0)),
            authentication_failures: AtomicU64::new(0),
            awaiting_identity: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            legacy_duplicates: AtomicU64::new(0),
            legacy_relayed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self, reason: DropReason) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        self.drops_by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn authentication_failure(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn identity_pending(&self) {
        self.awaiting_identity.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn legacy_duplicate(&self) {
        self.legacy_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn legacy_relay(&self, recipients: u64) {
        self.legacy_relayed.fetch_add(recipients, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            drops_by_reason: std::array::from_fn(|i| self.drops_by_reason[i].load(Ordering::Relaxed)),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            awaiting_identity: self.awaiting_identity.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            legacy_duplicates: self.legacy_duplicates.load(Ordering::Relaxed),
            legacy_relayed: self.legacy_relayed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_received = snapshot.packets_received,
            bytes_received = snapshot.bytes_received,
            packets_processed = snapshot.packets_processed,
            packets_dropped = snapshot.packets_dropped,
            authentication_failures = snapshot.authentication_failures,
            awaiting_identity = snapshot.awaiting_identity,
            packets_sent = snapshot.packets_sent,
            bytes_sent = snapshot.bytes_sent,
            frames_delivered = snapshot.frames_delivered,
            legacy_duplicates = snapshot.legacy_duplicates,
            legacy_relayed = snapshot.legacy_relayed,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
        for reason in DropReason::ALL {
            let count = snapshot.dropped(reason);
            if count > 0 {
                debug!(reason = reason.as_str(), count, "drops by reason");
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub drops_by_reason: [u64; DropReason::COUNT],
    pub authentication_failures: u64,
    pub awaiting_identity: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub frames_delivered: u64,
    pub legacy_duplicates: u64,
    pub legacy_relayed: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops_by_reason[reason as usize]
    }
}
