//! # Utility Modules
//!
//! Supporting utilities for compression, rate accounting, logging and timing.
//!
//! ## Components
//! - **Compression**: LZ4 block compression with an output size bound
//! - **Bandwidth**: per-group multicast token buckets
//! - **Dedup**: bounded history of recently seen 64-bit GUIDs
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Time**: wall-clock millisecond timestamps
//!
//! ## Security
//! - Decompression bomb protection (bounded by the maximum packet length)
//! - Bounded history so a flood of GUIDs cannot grow memory

pub mod bandwidth;
pub mod compression;
pub mod dedup;
pub mod logging;
pub mod metrics;
pub mod time;

pub use dedup::GuidHistory;
pub use metrics::{Metrics, MetricsSnapshot};
