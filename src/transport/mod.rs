//! # Transport Layer
//!
//! Datagram I/O for a node. The dispatcher itself never touches a socket;
//! it replies through the [`Transport`](crate::node::Transport) it is given.
//!
//! ## Components
//! - **UDP**: datagram classification, non-blocking sends, receive loop

pub mod udp;

pub use udp::{beacon, Datagram, DatagramCodec, UdpEndpoint, UdpTransport};
